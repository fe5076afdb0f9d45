use once_cell::sync::OnceCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::config::MemoryThresholds;
use crate::domains::export::types::*;
use crate::errors::{ExportError, PipelineResult};

const MB: u64 = 1024 * 1024;
const ROLLING_WINDOW: usize = 100;

/// Raw process memory reading in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReading {
    pub heap_used: u64,
    pub heap_total: u64,
    pub resident: u64,
}

/// Platform capability for reading memory and releasing cached allocations.
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> MemoryReading;

    /// Ask the runtime to release memory. Returns false when unsupported.
    fn release(&self) -> bool {
        false
    }
}

/// Reads `/proc/self/status` on Linux; reports zeros elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    fn parse_status(status: &str) -> MemoryReading {
        let field_kb = |name: &str| -> u64 {
            status
                .lines()
                .find(|line| line.starts_with(name))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        let resident = field_kb("VmRSS:") * 1024;
        // Rust has no managed heap; data segment size is the closest analogue
        let data = field_kb("VmData:") * 1024;
        MemoryReading {
            heap_used: if resident > 0 { resident } else { data },
            heap_total: field_kb("VmSize:") * 1024,
            resident,
        }
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn read(&self) -> MemoryReading {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => Self::parse_status(&status),
            Err(_) => MemoryReading::default(),
        }
    }
}

#[derive(Debug, Default)]
struct GovernorStats {
    peak: u64,
    window: VecDeque<u64>,
    forced_collections: u64,
    samples: u64,
    last: MemoryReading,
}

/// Process-wide memory governor shared by every running export.
pub struct MemoryGovernor {
    probe: Arc<dyn MemoryProbe>,
    thresholds: MemoryThresholds,
    stats: Mutex<GovernorStats>,
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("probe", &"<MemoryProbe>")
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

static SHARED_GOVERNOR: OnceCell<Arc<MemoryGovernor>> = OnceCell::new();

impl MemoryGovernor {
    pub fn new(thresholds: MemoryThresholds) -> Self {
        Self::with_probe(Arc::new(ProcessMemoryProbe), thresholds)
    }

    pub fn with_probe(probe: Arc<dyn MemoryProbe>, thresholds: MemoryThresholds) -> Self {
        Self {
            probe,
            thresholds,
            stats: Mutex::new(GovernorStats::default()),
        }
    }

    /// Get or initialize the process-wide governor. Thresholds apply on first call only.
    pub fn shared(thresholds: MemoryThresholds) -> Arc<MemoryGovernor> {
        SHARED_GOVERNOR
            .get_or_init(|| Arc::new(MemoryGovernor::new(thresholds)))
            .clone()
    }

    pub fn thresholds(&self) -> MemoryThresholds {
        self.thresholds
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, GovernorStats> {
        // Stats stay usable even if a panicking thread held the lock
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a new reading and fold it into the rolling statistics.
    pub fn sample(&self) -> MemorySnapshot {
        let reading = self.probe.read();
        let mut stats = self.lock_stats();

        stats.samples += 1;
        stats.last = reading;
        stats.peak = stats.peak.max(reading.heap_used);
        stats.window.push_back(reading.heap_used);
        if stats.window.len() > ROLLING_WINDOW {
            stats.window.pop_front();
        }

        Self::snapshot_of(&stats)
    }

    /// Statistics without taking a new reading.
    pub fn snapshot(&self) -> MemorySnapshot {
        Self::snapshot_of(&self.lock_stats())
    }

    fn snapshot_of(stats: &GovernorStats) -> MemorySnapshot {
        let rolling_average = if stats.window.is_empty() {
            0
        } else {
            stats.window.iter().sum::<u64>() / stats.window.len() as u64
        };

        MemorySnapshot {
            heap_used: stats.last.heap_used,
            heap_total: stats.last.heap_total,
            resident: stats.last.resident,
            peak: stats.peak,
            rolling_average,
            forced_collections: stats.forced_collections,
            samples: stats.samples,
        }
    }

    /// Classify a heap size against the configured thresholds.
    pub fn level_for(&self, heap_used: u64) -> MemoryPressureLevel {
        if heap_used >= self.thresholds.critical_bytes() {
            MemoryPressureLevel::Critical
        } else if heap_used >= self.thresholds.warning_bytes() {
            MemoryPressureLevel::Warning
        } else {
            MemoryPressureLevel::Normal
        }
    }

    /// Sample and classify current pressure.
    pub fn classify(&self) -> MemoryPressureLevel {
        let snapshot = self.sample();
        let level = self.level_for(snapshot.heap_used);

        if level != MemoryPressureLevel::Normal {
            log::warn!(
                "memory_pressure level={:?} heap_used_mb={} peak_mb={} rolling_avg_mb={} warning_mb={} critical_mb={}",
                level,
                snapshot.heap_used / MB,
                snapshot.peak / MB,
                snapshot.rolling_average / MB,
                self.thresholds.warning_mb,
                self.thresholds.critical_mb,
            );
        }

        level
    }

    /// Whether the last reading is above the "consider collecting" threshold.
    pub fn should_collect(&self) -> bool {
        self.sample().heap_used >= self.thresholds.collect_hint_bytes()
    }

    /// Request a collection hint. Bookkeeping is updated even when unsupported.
    pub fn force_collect(&self) {
        let honored = self.probe.release();
        let count = {
            let mut stats = self.lock_stats();
            stats.forced_collections += 1;
            stats.forced_collections
        };
        log::debug!("Forced collection #{} (honored: {})", count, honored);
    }

    /// Fail fast when memory stays critical after a forced collection.
    pub fn ensure_headroom(&self) -> PipelineResult<MemoryPressureLevel> {
        let level = self.classify();
        if level != MemoryPressureLevel::Critical {
            return Ok(level);
        }

        self.force_collect();
        let level = self.classify();
        if level == MemoryPressureLevel::Critical {
            let snapshot = self.snapshot();
            log::error!(
                "Memory still critical after forced collection: {} MB",
                snapshot.heap_used / MB
            );
            return Err(ExportError::InsufficientMemory {
                heap_used_mb: snapshot.heap_used / MB,
                critical_mb: self.thresholds.critical_mb,
            });
        }

        Ok(level)
    }
}

/// Probe that always reports the same heap size.
#[cfg(test)]
pub struct FixedProbe {
    heap: u64,
}

#[cfg(test)]
impl FixedProbe {
    pub fn mb(heap_mb: u64) -> Self {
        Self { heap: heap_mb * MB }
    }
}

#[cfg(test)]
impl MemoryProbe for FixedProbe {
    fn read(&self) -> MemoryReading {
        MemoryReading {
            heap_used: self.heap,
            heap_total: self.heap * 2,
            resident: self.heap,
        }
    }
}

/// Probe replaying a scripted sequence of heap sizes; the last value repeats.
#[cfg(test)]
pub struct ScriptedProbe {
    readings_mb: Mutex<VecDeque<u64>>,
    last_mb: Mutex<u64>,
    releases: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl ScriptedProbe {
    pub fn new(readings_mb: &[u64]) -> Self {
        Self {
            readings_mb: Mutex::new(readings_mb.iter().copied().collect()),
            last_mb: Mutex::new(readings_mb.last().copied().unwrap_or(0)),
            releases: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl MemoryProbe for ScriptedProbe {
    fn read(&self) -> MemoryReading {
        let mb = match self.readings_mb.lock().unwrap().pop_front() {
            Some(v) => {
                *self.last_mb.lock().unwrap() = v;
                v
            }
            None => *self.last_mb.lock().unwrap(),
        };
        MemoryReading {
            heap_used: mb * MB,
            heap_total: mb * MB * 2,
            resident: mb * MB,
        }
    }

    fn release(&self) -> bool {
        self.releases.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(probe: Arc<dyn MemoryProbe>) -> MemoryGovernor {
        MemoryGovernor::with_probe(probe, MemoryThresholds::default())
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(governor(Arc::new(FixedProbe::mb(100))).classify(), MemoryPressureLevel::Normal);
        assert_eq!(governor(Arc::new(FixedProbe::mb(600))).classify(), MemoryPressureLevel::Warning);
        assert_eq!(governor(Arc::new(FixedProbe::mb(1100))).classify(), MemoryPressureLevel::Critical);
        assert_eq!(governor(Arc::new(FixedProbe::mb(1024))).classify(), MemoryPressureLevel::Critical);
    }

    #[test]
    fn test_still_critical_after_collect_fails() {
        let gov = governor(Arc::new(FixedProbe::mb(1100)));
        let err = gov.ensure_headroom().unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_MEMORY");
        assert_eq!(gov.snapshot().forced_collections, 1);
    }

    #[test]
    fn test_recovers_when_collection_frees_memory() {
        let probe = Arc::new(ScriptedProbe::new(&[1100, 300]));
        let gov = governor(probe.clone());
        assert_eq!(gov.ensure_headroom().unwrap(), MemoryPressureLevel::Normal);
        assert_eq!(probe.releases(), 1);
        assert_eq!(gov.snapshot().forced_collections, 1);
    }

    #[test]
    fn test_force_collect_counts_without_runtime_hook() {
        let gov = governor(Arc::new(FixedProbe::mb(10)));
        gov.force_collect();
        gov.force_collect();
        assert_eq!(gov.snapshot().forced_collections, 2);
    }

    #[test]
    fn test_rolling_average_and_peak() {
        let gov = governor(Arc::new(ScriptedProbe::new(&[100, 300, 200])));
        gov.sample();
        gov.sample();
        let snapshot = gov.sample();
        assert_eq!(snapshot.peak, 300 * MB);
        assert_eq!(snapshot.rolling_average, 200 * MB);
        assert_eq!(snapshot.samples, 3);
        assert_eq!(snapshot.heap_used, 200 * MB);
    }

    #[test]
    fn test_rolling_window_keeps_last_hundred() {
        let mut script = vec![1000u64; 10];
        script.extend(std::iter::repeat(100).take(100));
        let gov = governor(Arc::new(ScriptedProbe::new(&script)));
        let mut snapshot = MemorySnapshot::default();
        for _ in 0..110 {
            snapshot = gov.sample();
        }
        assert_eq!(snapshot.rolling_average, 100 * MB);
        assert_eq!(snapshot.peak, 1000 * MB);
    }

    #[test]
    fn test_should_collect_uses_hint_threshold() {
        assert!(!governor(Arc::new(FixedProbe::mb(100))).should_collect());
        assert!(governor(Arc::new(FixedProbe::mb(300))).should_collect());
    }

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\tcargo\nVmSize:\t  204800 kB\nVmRSS:\t   51200 kB\nVmData:\t 10240 kB\n";
        let reading = ProcessMemoryProbe::parse_status(status);
        assert_eq!(reading.resident, 50 * MB);
        assert_eq!(reading.heap_used, 50 * MB);
        assert_eq!(reading.heap_total, 200 * MB);
    }
}
