//! Memory-pressure admission gate.
//!
//! A single process-wide gate on fetch dispatch: while observed memory usage
//! is at or above the threshold, no new fetch starts (in-flight requests
//! complete). Dispatch resumes once usage drops below the threshold with a
//! small hysteresis margin. The gate is a stability safeguard only — it
//! never drops or duplicates scheduled work.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Margin below the threshold before dispatch resumes.
const RESUME_MARGIN: f32 = 5.0;
/// How often the gate re-samples while paused.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Source of a memory-usage reading. `None` means no reading is available,
/// in which case the gate always admits.
pub trait MemoryProbe: Send + Sync {
    /// System memory in use, as a percentage of total.
    fn used_percent(&self) -> Option<f32>;
}

/// Probe reading `/proc/meminfo`. On other platforms, or when the file is
/// unreadable, it reports no reading.
pub struct ProcMeminfoProbe;

impl MemoryProbe for ProcMeminfoProbe {
    fn used_percent(&self) -> Option<f32> {
        let text = std::fs::read_to_string("/proc/meminfo").ok()?;
        let field = |name: &str| -> Option<f64> {
            text.lines()
                .find(|l| l.starts_with(name))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()
        };
        let total = field("MemTotal:")?;
        let available = field("MemAvailable:")?;
        if total <= 0.0 {
            return None;
        }
        Some(((total - available) / total * 100.0) as f32)
    }
}

/// The dispatch gate.
pub struct MemoryGate {
    probe: Arc<dyn MemoryProbe>,
    threshold: f32,
    enabled: bool,
    /// Peak observed usage, stored as f32 bits.
    peak: AtomicU32,
}

impl MemoryGate {
    pub fn new(probe: Arc<dyn MemoryProbe>, threshold: f32, enabled: bool) -> Self {
        Self {
            probe,
            threshold,
            enabled,
            peak: AtomicU32::new(0),
        }
    }

    /// Gate that never pauses.
    pub fn disabled() -> Self {
        Self::new(Arc::new(ProcMeminfoProbe), 100.0, false)
    }

    /// Wait until dispatch is admitted. Returns immediately when the gate is
    /// disabled, usage is below the threshold, or no reading is available.
    pub async fn admit(&self) {
        if !self.enabled {
            return;
        }
        let Some(usage) = self.sample() else { return };
        if usage < self.threshold {
            return;
        }

        warn!(
            "memory usage {usage:.1}% at/above {:.1}% threshold, pausing fetch dispatch",
            self.threshold
        );
        let resume_below = self.threshold - RESUME_MARGIN;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            match self.sample() {
                None => break,
                Some(now) if now < resume_below => {
                    info!("memory usage back to {now:.1}%, resuming fetch dispatch");
                    break;
                }
                Some(_) => {}
            }
        }
    }

    /// Take a reading and fold it into the peak.
    pub fn sample(&self) -> Option<f32> {
        let usage = self.probe.used_percent()?;
        let mut current = self.peak.load(Ordering::Relaxed);
        while usage > f32::from_bits(current) {
            match self.peak.compare_exchange_weak(
                current,
                usage.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Some(usage)
    }

    /// Highest usage observed so far.
    pub fn peak_percent(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct ScriptedProbe {
        readings: Vec<Option<f32>>,
        cursor: AtomicU64,
    }

    impl MemoryProbe for ScriptedProbe {
        fn used_percent(&self) -> Option<f32> {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
            *self.readings.get(i).unwrap_or(self.readings.last().unwrap())
        }
    }

    #[tokio::test]
    async fn admits_immediately_below_threshold() {
        let gate = MemoryGate::new(
            Arc::new(ScriptedProbe {
                readings: vec![Some(40.0)],
                cursor: AtomicU64::new(0),
            }),
            85.0,
            true,
        );
        gate.admit().await;
        assert!((gate.peak_percent() - 40.0).abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_until_usage_drops_below_resume_margin() {
        let gate = MemoryGate::new(
            Arc::new(ScriptedProbe {
                readings: vec![Some(90.0), Some(86.0), Some(82.0), Some(70.0)],
                cursor: AtomicU64::new(0),
            }),
            85.0,
            true,
        );
        // 90 triggers the pause; 86 and 82 are still >= threshold-5; 70 resumes.
        gate.admit().await;
        assert!((gate.peak_percent() - 90.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn unknown_reading_admits() {
        let gate = MemoryGate::new(
            Arc::new(ScriptedProbe {
                readings: vec![None],
                cursor: AtomicU64::new(0),
            }),
            85.0,
            true,
        );
        gate.admit().await;
    }

    #[tokio::test]
    async fn disabled_gate_never_samples() {
        let gate = MemoryGate::disabled();
        gate.admit().await;
        assert_eq!(gate.peak_percent(), 0.0);
    }
}
