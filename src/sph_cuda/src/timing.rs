//! Phase timing for device evaluations.
//!
//! Timings are collected only when the `profiling` feature is enabled.
//! Without it [`TimingCollector`] compiles to a no-op, `time_phase!` skips
//! the measurement and every reported duration is zero.

use serde::{Deserialize, Serialize};
#[cfg(feature = "profiling")]
use std::time::Instant;

/// Timing breakdown for one device evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTiming {
    /// Host → device copies of samples and prefactors
    pub upload_ms: f64,
    /// Kernel launch until the device is idle
    pub kernel_ms: f64,
    /// Device → host copies of the outputs
    pub download_ms: f64,
    pub total_ms: f64,
}

/// Running measurement of one named phase.
#[cfg(feature = "profiling")]
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
}

#[cfg(feature = "profiling")]
impl PhaseTimer {
    #[inline]
    pub fn start(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }

    /// Stop the timer and add its duration to `collector` under its phase.
    pub fn finish(self, collector: &mut TimingCollector) -> f64 {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        tracing::trace!(phase = self.phase, elapsed_ms, "Phase finished");
        collector.record_phase(self.phase, elapsed_ms);
        elapsed_ms
    }
}

/// Accumulates phase durations for one evaluation.
#[cfg(feature = "profiling")]
#[derive(Debug, Default)]
pub struct TimingCollector {
    start: Option<Instant>,
    timing: EvaluationTiming,
}

#[cfg(feature = "profiling")]
impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.timing = EvaluationTiming::default();
    }

    pub fn record_phase(&mut self, phase: &str, duration_ms: f64) {
        match phase {
            "upload" => self.timing.upload_ms += duration_ms,
            "kernel" => self.timing.kernel_ms += duration_ms,
            "download" => self.timing.download_ms += duration_ms,
            _ => {}
        }
    }

    pub fn finish(&mut self) -> EvaluationTiming {
        self.timing.total_ms = self
            .start
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        std::mem::take(&mut self.timing)
    }
}

/// No-op collector when profiling is disabled.
#[cfg(not(feature = "profiling"))]
#[derive(Debug, Default)]
pub struct TimingCollector;

#[cfg(not(feature = "profiling"))]
impl TimingCollector {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn start(&mut self) {}

    #[inline(always)]
    pub fn record_phase(&mut self, _phase: &str, _duration_ms: f64) {}

    #[inline(always)]
    pub fn finish(&mut self) -> EvaluationTiming {
        EvaluationTiming::default()
    }
}

/// Time a block and record it under `phase`.
///
/// ```ignore
/// let handle = time_phase!(collector, "upload", {
///     client.create(f32::as_bytes(&data))
/// });
/// ```
#[macro_export]
macro_rules! time_phase {
    ($collector:expr, $phase:expr, $block:expr) => {{
        #[cfg(feature = "profiling")]
        let timer = $crate::timing::PhaseTimer::start($phase);

        let result = $block;

        #[cfg(feature = "profiling")]
        timer.finish(&mut $collector);

        result
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_collector() {
        let mut collector = TimingCollector::new();

        collector.start();
        collector.record_phase("upload", 1.0);
        collector.record_phase("kernel", 2.5);
        collector.record_phase("download", 0.5);
        collector.record_phase("unknown", 10.0);
        let timing = collector.finish();

        #[cfg(feature = "profiling")]
        {
            assert_eq!(timing.upload_ms, 1.0);
            assert_eq!(timing.kernel_ms, 2.5);
            assert_eq!(timing.download_ms, 0.5);
        }

        #[cfg(not(feature = "profiling"))]
        {
            assert_eq!(timing, EvaluationTiming::default());
        }
    }

    #[test]
    fn test_time_phase_returns_block_value() {
        let mut collector = TimingCollector::new();
        collector.start();
        let value = crate::time_phase!(collector, "kernel", { 21 * 2 });
        assert_eq!(value, 42);
        let _ = collector.finish();
    }

    #[cfg(feature = "profiling")]
    #[test]
    fn test_phase_timer_records_under_its_phase() {
        let mut collector = TimingCollector::new();
        collector.start();
        let timer = PhaseTimer::start("download");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let elapsed_ms = timer.finish(&mut collector);
        let timing = collector.finish();

        assert!(elapsed_ms >= 2.0);
        assert_eq!(timing.download_ms, elapsed_ms);
        assert_eq!(timing.upload_ms, 0.0);
        assert_eq!(timing.kernel_ms, 0.0);
    }
}
