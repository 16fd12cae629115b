//! Governor tunables.
//!
//! A plain config struct seeds the governor; the live copies are
//! atomics so every knob stays writable at runtime without touching
//! any lock on the idle path.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Default deviation bound for accepting a residency prediction.
pub const DEFAULT_REF_STDDEV_US: u32 = 100;

/// Default margin added to predictions when arming validation timers.
pub const DEFAULT_TIMER_MARGIN_US: u32 = 100;

/// Initial governor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    /// Run the residency predictors.
    pub prediction_enabled: bool,
    /// Deviation bound for accepting a prediction.
    pub ref_stddev_us: u32,
    /// Margin added to predictions when arming validation timers.
    pub timer_margin_us: u32,
    /// Refuse every level beyond the shallowest.
    pub sleep_disabled: bool,
    /// Fixed suspend wakeup, seconds; 0 leaves the wakeup unset.
    pub suspend_wake_time_s: u32,
}

impl GovernorConfig {
    /// Stock settings: prediction on, sleep allowed, no fixed wakeup.
    pub const fn new() -> Self {
        GovernorConfig {
            prediction_enabled: true,
            ref_stddev_us: DEFAULT_REF_STDDEV_US,
            timer_margin_us: DEFAULT_TIMER_MARGIN_US,
            sleep_disabled: false,
            suspend_wake_time_s: 0,
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Live, runtime-writable copies of the config.
#[derive(Debug)]
pub(crate) struct Tunables {
    prediction: AtomicBool,
    ref_stddev_us: AtomicU32,
    timer_margin_us: AtomicU32,
    sleep_disabled: AtomicBool,
    suspend_wake_time_s: AtomicU32,
}

impl Tunables {
    pub fn new(cfg: GovernorConfig) -> Self {
        Tunables {
            prediction: AtomicBool::new(cfg.prediction_enabled),
            ref_stddev_us: AtomicU32::new(cfg.ref_stddev_us),
            timer_margin_us: AtomicU32::new(cfg.timer_margin_us),
            sleep_disabled: AtomicBool::new(cfg.sleep_disabled),
            suspend_wake_time_s: AtomicU32::new(cfg.suspend_wake_time_s),
        }
    }

    #[inline(always)]
    pub fn prediction(&self) -> bool {
        self.prediction.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_prediction(&self, v: bool) {
        self.prediction.store(v, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn ref_stddev_us(&self) -> u32 {
        self.ref_stddev_us.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_ref_stddev_us(&self, v: u32) {
        self.ref_stddev_us.store(v, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn timer_margin_us(&self) -> u32 {
        self.timer_margin_us.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_timer_margin_us(&self, v: u32) {
        self.timer_margin_us.store(v, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn sleep_disabled(&self) -> bool {
        self.sleep_disabled.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_sleep_disabled(&self, v: bool) {
        self.sleep_disabled.store(v, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn suspend_wake_time_s(&self) -> u32 {
        self.suspend_wake_time_s.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_suspend_wake_time_s(&self, v: u32) {
        self.suspend_wake_time_s.store(v, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = GovernorConfig::default();
        assert!(cfg.prediction_enabled);
        assert!(!cfg.sleep_disabled);
        assert_eq!(cfg.ref_stddev_us, DEFAULT_REF_STDDEV_US);
        assert_eq!(cfg.timer_margin_us, DEFAULT_TIMER_MARGIN_US);
        assert_eq!(cfg.suspend_wake_time_s, 0);
    }

    #[test]
    fn test_tunables_track_writes() {
        let t = Tunables::new(GovernorConfig::default());
        assert!(t.prediction());
        t.set_prediction(false);
        assert!(!t.prediction());
        t.set_ref_stddev_us(250);
        assert_eq!(t.ref_stddev_us(), 250);
        t.set_sleep_disabled(true);
        assert!(t.sleep_disabled());
        t.set_suspend_wake_time_s(30);
        assert_eq!(t.suspend_wake_time_s(), 30);
    }
}
