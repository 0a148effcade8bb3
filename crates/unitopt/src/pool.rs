//! Worker threads.
//!
//! [`TransformPool`] runs transforms on a fixed set of CPU workers fed by a
//! bounded queue; the submitting thread waits for the reply up to the
//! watchdog deadline and cancels the job cooperatively when it expires.
//!
//! [`BackgroundWorker`] is a single thread that drains I/O tasks (cache
//! stores, prewarm, persistence) so the transform path never blocks on disk.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::TransformError;
use crate::governor::DiagnosticReport;
use crate::loader::LoaderContext;
use crate::passes::panic_message;
use crate::sandbox::JobControl;
use crate::transform::TransformOutcome;
use crate::unit::digest::StrongHash;

/// One unit waiting for a worker.
pub struct TransformJob {
    pub unit_key: String,
    pub bytes: Bytes,
    pub loader: LoaderContext,
    pub control: Arc<JobControl>,
    reply: Sender<TransformOutcome>,
}

impl std::fmt::Debug for TransformJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformJob")
            .field("unit_key", &self.unit_key)
            .field("len", &self.bytes.len())
            .field("cancelled", &self.control.is_cancelled())
            .finish()
    }
}

type JobHandler = dyn Fn(&TransformJob) -> TransformOutcome + Send + Sync;

pub struct TransformPool {
    sender: Option<Sender<TransformJob>>,
    workers: Vec<thread::JoinHandle<()>>,
    watchdog: Duration,
}

impl TransformPool {
    pub fn start<F>(
        workers: usize,
        queue_capacity: usize,
        watchdog: Duration,
        handler: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(&TransformJob) -> TransformOutcome + Send + Sync + 'static,
    {
        let (sender, receiver) = channel::bounded::<TransformJob>(queue_capacity);
        let handler: Arc<JobHandler> = Arc::new(handler);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers.max(1) {
            let receiver: Receiver<TransformJob> = receiver.clone();
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("unitopt-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if job.control.is_cancelled() {
                            continue;
                        }
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&job)))
                            .unwrap_or_else(|payload| {
                                TransformOutcome::failed(TransformError::Panicked(panic_message(
                                    &payload,
                                )))
                            });
                        // The submitter may have given up already.
                        let _ = job.reply.send(outcome);
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers: handles,
            watchdog,
        })
    }

    /// Queue a transform and wait for it, at most the watchdog timeout.
    pub fn run(
        &self,
        unit_key: &str,
        bytes: Bytes,
        loader: LoaderContext,
    ) -> Result<TransformOutcome, TransformError> {
        let sender = self.sender.as_ref().ok_or(TransformError::PoolClosed)?;
        let control = JobControl::new();
        let (reply, replies) = channel::bounded(1);
        let job = TransformJob {
            unit_key: unit_key.to_string(),
            bytes,
            loader,
            control: Arc::clone(&control),
            reply,
        };
        match sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(TransformError::QueueFull),
            Err(TrySendError::Disconnected(_)) => return Err(TransformError::PoolClosed),
        }

        match replies.recv_timeout(self.watchdog) {
            Ok(outcome) => Ok(outcome),
            Err(RecvTimeoutError::Timeout) => {
                let pass = control.current_pass();
                control.cancel();
                warn!(unit = %unit_key, pass = ?pass, "Watchdog expired, job cancelled");
                Err(TransformError::Timeout { pass })
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransformError::Panicked(
                "worker dropped the job without replying".to_string(),
            )),
        }
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter_map(|handle| handle.thread().name().map(str::to_string))
            .collect()
    }

    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }
}

impl Drop for TransformPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Transform worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for TransformPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPool")
            .field("workers", &self.workers.len())
            .field("watchdog", &self.watchdog)
            .finish()
    }
}

/// Deferred I/O work.
#[derive(Debug)]
pub enum BackgroundTask {
    /// Durably cache a verified result.
    Store {
        unit_key: String,
        source: StrongHash,
        bytes: Bytes,
    },
    /// Promote these units from L3 into L2.
    Prewarm(Vec<String>),
    /// Write index, dependency graph, governor records and load order.
    Persist,
    /// Write governor failure records if they changed.
    SaveRecords,
    /// Render and write an emergency-shutdown report.
    WriteReport(Box<DiagnosticReport>),
    /// Acknowledged once every earlier task has run.
    Flush(Sender<()>),
}

pub struct BackgroundWorker {
    sender: Option<Sender<BackgroundTask>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn start<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(BackgroundTask) + Send + 'static,
    {
        let (sender, receiver) = channel::unbounded::<BackgroundTask>();
        let handle = thread::Builder::new()
            .name("unitopt-background".to_string())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    match task {
                        BackgroundTask::Flush(ack) => {
                            let _ = ack.send(());
                        }
                        task => {
                            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(task)));
                            if let Err(payload) = outcome {
                                warn!(panic = %panic_message(&payload), "Background task panicked");
                            }
                        }
                    }
                }
                debug!("Background worker exiting");
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue `task`. Returns false once the worker is gone.
    pub fn submit(&self, task: BackgroundTask) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.send(task).is_ok())
    }

    /// Block until every task queued so far has run.
    pub fn flush(&self) -> bool {
        let (ack, acked) = channel::bounded(1);
        self.submit(BackgroundTask::Flush(ack)) && acked.recv().is_ok()
    }

    pub fn thread_name(&self) -> Option<String> {
        self.handle
            .as_ref()
            .and_then(|handle| handle.thread().name().map(str::to_string))
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Background worker panicked");
        }
    }
}

impl std::fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("active", &self.sender.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::PipelineReport;
    use crate::transform::Optimized;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn echo(job: &TransformJob) -> TransformOutcome {
        TransformOutcome {
            report: PipelineReport::default(),
            output: Ok(Optimized {
                bytes: job.bytes.clone(),
                changed: false,
            }),
        }
    }

    #[test]
    fn runs_job_on_worker() {
        let pool = TransformPool::start(2, 4, Duration::from_secs(5), echo).unwrap();
        let outcome = pool
            .run("k", Bytes::from_static(b"unit"), LoaderContext::new())
            .unwrap();
        assert_eq!(outcome.output.unwrap().bytes.as_ref(), b"unit");
        assert_eq!(pool.worker_names(), vec!["unitopt-worker-0", "unitopt-worker-1"]);
    }

    #[test]
    fn watchdog_cancels_slow_job() {
        let pool = TransformPool::start(1, 4, Duration::from_millis(20), |job: &TransformJob| {
            while !job.control.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            echo(job)
        })
        .unwrap();
        let err = pool
            .run("k", Bytes::new(), LoaderContext::new())
            .unwrap_err();
        assert_eq!(err, TransformError::Timeout { pass: None });
    }

    #[test]
    fn panicking_job_becomes_failure() {
        let pool = TransformPool::start(1, 4, Duration::from_secs(5), |_job: &TransformJob| -> TransformOutcome {
            panic!("worker boom")
        })
        .unwrap();
        let outcome = pool.run("k", Bytes::new(), LoaderContext::new()).unwrap();
        assert_eq!(
            outcome.output.unwrap_err(),
            TransformError::Panicked("worker boom".to_string())
        );
        // The worker survived.
        let outcome = pool.run("k", Bytes::new(), LoaderContext::new()).unwrap();
        assert!(outcome.output.is_err());
    }

    #[test]
    fn full_queue_is_backpressure() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let worker_gate = Arc::clone(&gate);
        let pool = Arc::new(
            TransformPool::start(1, 1, Duration::from_secs(5), move |job: &TransformJob| {
                let _open = worker_gate.lock();
                echo(job)
            })
            .unwrap(),
        );

        // One job occupies the worker, one fills the queue.
        let mut waiting = Vec::new();
        for _ in 0..2 {
            let pool = Arc::clone(&pool);
            waiting.push(thread::spawn(move || {
                pool.run("k", Bytes::new(), LoaderContext::new())
            }));
            thread::sleep(Duration::from_millis(50));
        }
        let err = pool.run("k", Bytes::new(), LoaderContext::new()).unwrap_err();
        assert_eq!(err, TransformError::QueueFull);

        drop(held);
        for handle in waiting {
            assert!(handle.join().unwrap().is_ok());
        }
    }

    #[test]
    fn background_flush_waits_for_earlier_tasks() {
        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);
        let worker = BackgroundWorker::start(move |task| {
            if let BackgroundTask::Prewarm(units) = task {
                thread::sleep(Duration::from_millis(10));
                seen.fetch_add(units.len() as u64, Ordering::SeqCst);
            }
        })
        .unwrap();
        assert!(worker.submit(BackgroundTask::Prewarm(vec!["a".into(), "b".into()])));
        assert!(worker.submit(BackgroundTask::Persist));
        assert!(worker.flush());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(worker.thread_name().as_deref(), Some("unitopt-background"));
    }

    #[test]
    fn background_survives_panicking_task() {
        let worker = BackgroundWorker::start(|task| {
            if matches!(task, BackgroundTask::Persist) {
                panic!("disk on fire");
            }
        })
        .unwrap();
        assert!(worker.submit(BackgroundTask::Persist));
        assert!(worker.flush());
    }
}
