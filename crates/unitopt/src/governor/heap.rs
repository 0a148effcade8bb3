//! Heap backpressure.
//!
//! A background thread samples process memory. Crossing the high-water mark
//! pauses optimization and asks the owner to shed L1/L2; dropping below the
//! low-water mark resumes. The gap between the two marks is the hysteresis.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{info, warn};

use crate::config::HeapConfig;

use super::report;

/// Source of a memory usage reading.
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> Option<u64>;
}

/// Resident set size from procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStatm;

impl MemoryProbe for ProcStatm {
    fn used_bytes(&self) -> Option<u64> {
        report::resident_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureChange {
    Engaged,
    Released,
}

/// Hysteresis state shared between the monitor and the governor.
#[derive(Debug)]
pub struct HeapGauge {
    paused: AtomicBool,
    high_water: u64,
    low_water: u64,
}

impl HeapGauge {
    pub fn new(high_water: u64, low_water: u64) -> Self {
        Self {
            paused: AtomicBool::new(false),
            high_water,
            low_water,
        }
    }

    pub fn from_config(config: &HeapConfig) -> Self {
        Self::new(config.high_water_bytes, config.low_water_bytes)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Feed one reading. Returns the edge crossed, if any.
    pub fn observe(&self, used: u64) -> Option<PressureChange> {
        if used >= self.high_water {
            (!self.paused.swap(true, Ordering::AcqRel)).then_some(PressureChange::Engaged)
        } else if used <= self.low_water {
            self.paused
                .swap(false, Ordering::AcqRel)
                .then_some(PressureChange::Released)
        } else {
            None
        }
    }
}

/// Handle to the sampling thread. Dropping it stops and joins the thread.
pub struct HeapMonitor {
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HeapMonitor {
    pub fn start<F>(
        interval: Duration,
        probe: Box<dyn MemoryProbe>,
        gauge: Arc<HeapGauge>,
        on_change: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(PressureChange) + Send + 'static,
    {
        let (stop, stopped) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("unitopt-heap".to_string())
            .spawn(move || {
                loop {
                    if let Some(used) = probe.used_bytes()
                        && let Some(change) = gauge.observe(used)
                    {
                        match change {
                            PressureChange::Engaged => {
                                warn!(used, "Heap above high-water mark, pausing optimization")
                            }
                            PressureChange::Released => {
                                info!(used, "Heap below low-water mark, resuming optimization")
                            }
                        }
                        on_change(change);
                    }
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for HeapMonitor {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Heap monitor thread panicked");
        }
    }
}

impl std::fmt::Debug for HeapMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapMonitor")
            .field("active", &self.stop.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn hysteresis_between_marks() {
        let gauge = HeapGauge::new(100, 50);
        assert_eq!(gauge.observe(80), None);
        assert_eq!(gauge.observe(100), Some(PressureChange::Engaged));
        assert!(gauge.is_paused());
        assert_eq!(gauge.observe(120), None);
        assert_eq!(gauge.observe(70), None, "between marks stays paused");
        assert!(gauge.is_paused());
        assert_eq!(gauge.observe(50), Some(PressureChange::Released));
        assert!(!gauge.is_paused());
        assert_eq!(gauge.observe(10), None);
    }

    struct Scripted(AtomicU64);

    impl MemoryProbe for Scripted {
        fn used_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::Relaxed))
        }
    }

    #[test]
    fn monitor_reports_edges_and_stops_on_drop() {
        let gauge = Arc::new(HeapGauge::new(100, 50));
        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&changes);
        let monitor = HeapMonitor::start(
            Duration::from_millis(5),
            Box::new(Scripted(AtomicU64::new(500))),
            Arc::clone(&gauge),
            move |change| seen.lock().unwrap().push(change),
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !gauge.is_paused() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(monitor);
        assert!(gauge.is_paused());
        assert_eq!(*changes.lock().unwrap(), vec![PressureChange::Engaged]);
    }
}
