// 滑动窗口故障计数
// Sticky error code once the fault rate saturates a sliding window

use std::collections::VecDeque;

/// Faults kept in the window.
const WINDOW_SIZE: usize = 180;

/// Window span in seconds.
const WINDOW_SPAN: f64 = 60.0 * 60.0 * 3.0;

/// Counts non-fatal faults and raises a sticky, user-visible error code
/// once 180 of them land within three hours. The code clears itself after
/// the fault rate subsides for the same span, but only when `maybe_clear`
/// is called; the external scheduler has to call it at least hourly.
#[derive(Debug, Clone, Default)]
pub struct ErrorAccumulator {
    timestamps: VecDeque<f64>,
    error_code: Option<u16>,
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_code(&self) -> Option<u16> {
        self.error_code
    }

    /// Record one fault occurrence.
    pub fn record_fault(&mut self, now: f64) {
        self.timestamps.push_back(now);
        if self.timestamps.len() > WINDOW_SIZE {
            self.timestamps.pop_front();
        }
    }

    /// Raise `code` if the window is saturated.
    pub fn maybe_raise(&mut self, now: f64, code: u16) {
        if self.timestamps.len() >= WINDOW_SIZE
            && self.timestamps.front().is_some_and(|first| now - first <= WINDOW_SPAN)
            && self.error_code != Some(code)
        {
            log::error!("fault rate exceeded {WINDOW_SIZE} in 3 hours, raising error code {code}");
            self.error_code = Some(code);
        }
    }

    /// Clear the active code once the oldest recorded fault has aged out.
    pub fn maybe_clear(&mut self, now: f64) {
        if self.timestamps.len() >= WINDOW_SIZE
            && self.timestamps.front().is_some_and(|first| now - first > WINDOW_SPAN)
            && self.error_code.is_some()
        {
            log::info!("fault rate subsided, clearing error code {:?}", self.error_code);
            self.error_code = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE: u16 = 8;

    #[test]
    fn stays_quiet_below_the_fault_count() {
        let mut acc = ErrorAccumulator::new();
        for i in 0..179 {
            acc.record_fault(i as f64);
            acc.maybe_raise(i as f64, CODE);
        }
        assert_eq!(acc.error_code(), None);
    }

    #[test]
    fn raises_at_180_faults_within_the_window() {
        let mut acc = ErrorAccumulator::new();
        // 180 faults spread over 10 minutes
        for i in 0..180 {
            let now = i as f64 * 600.0 / 180.0;
            acc.record_fault(now);
            acc.maybe_raise(now, CODE);
        }
        assert_eq!(acc.error_code(), Some(CODE));
    }

    #[test]
    fn slow_fault_rate_never_raises() {
        let mut acc = ErrorAccumulator::new();
        // one fault every 2 minutes: 180 of them span 6 hours
        for i in 0..360 {
            let now = i as f64 * 120.0;
            acc.record_fault(now);
            acc.maybe_raise(now, CODE);
        }
        assert_eq!(acc.error_code(), None);
    }

    #[test]
    fn clears_once_the_oldest_fault_ages_out() {
        let mut acc = ErrorAccumulator::new();
        let mut now = 0.0;
        for _ in 0..180 {
            now += 1.0;
            acc.record_fault(now);
            acc.maybe_raise(now, CODE);
        }
        assert_eq!(acc.error_code(), Some(CODE));

        // exactly 3 hours after the oldest fault: nothing happens
        acc.maybe_clear(1.0 + WINDOW_SPAN);
        assert_eq!(acc.error_code(), Some(CODE));

        // 3 hours and 1 second after the oldest fault
        acc.maybe_clear(1.0 + WINDOW_SPAN + 1.0);
        assert_eq!(acc.error_code(), None);
    }

    #[test]
    fn eviction_keeps_only_the_latest_faults() {
        let mut acc = ErrorAccumulator::new();
        // 180 ancient faults, then 180 recent ones
        for i in 0..180 {
            acc.record_fault(i as f64);
        }
        let base = 1_000_000.0;
        for i in 0..180 {
            acc.record_fault(base + i as f64);
        }
        acc.maybe_raise(base + 180.0, CODE);
        assert_eq!(acc.error_code(), Some(CODE));
    }
}
