//! Parallel script verification.
//!
//! Block connection queues one `ScriptCheck` per input on a `CheckQueueControl`
//! and waits for the verdict once every input has been queued. Workers pull
//! chunks of checks off a bounded channel; the first failure in a batch makes
//! the remaining chunks of that batch a no-op.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::core::script::{self, ScriptError, SignatureChecker};
use crate::core::types::{Hash256, Transaction, TxOutput};

use super::sigcache::{CachingChecker, SignatureCache};

/// Upper bound on script verification threads
pub const MAX_SCRIPTCHECK_THREADS: usize = 15;

/// Checks handed to a worker at a time
const CHUNK_SIZE: usize = 32;

/// Worker count for a `-par` setting: 0 uses every core, a negative value
/// leaves that many cores free. One thread means verify inline.
pub fn script_threads(par: i32) -> usize {
    let cores = num_cpus::get() as i32;
    let n = if par <= 0 { cores + par } else { par };
    if n <= 1 {
        0
    } else {
        (n as usize).min(MAX_SCRIPTCHECK_THREADS)
    }
}

/// Verification of one input against the coin it spends.
#[derive(Debug, Clone)]
pub struct ScriptCheck {
    pub tx: Arc<Transaction>,
    pub input_index: usize,
    pub prev_output: TxOutput,
}

impl ScriptCheck {
    pub fn run(&self, checker: &dyn SignatureChecker) -> Result<(), ScriptError> {
        script::verify_spend(&self.tx, self.input_index, &self.prev_output, checker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("script check failed for input {}:{input_index}: {error}", hex::encode(.txid))]
pub struct ScriptCheckError {
    pub txid: Hash256,
    pub input_index: usize,
    pub error: ScriptError,
}

#[derive(Default)]
struct Batch {
    failed: AtomicBool,
    first_error: Mutex<Option<ScriptCheckError>>,
    pending: Mutex<usize>,
    done: Condvar,
}

impl Batch {
    fn fail(&self, check: &ScriptCheck, error: ScriptError) {
        self.failed.store(true, Ordering::Release);
        let mut first = self.first_error.lock().unwrap_or_else(|e| e.into_inner());
        if first.is_none() {
            *first = Some(ScriptCheckError { txid: check.tx.txid(), input_index: check.input_index, error });
        }
    }

    fn run(&self, checks: &[ScriptCheck], checker: &dyn SignatureChecker) {
        for check in checks {
            if self.failed.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = check.run(checker) {
                self.fail(check, e);
                return;
            }
        }
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.done.notify_all();
        }
    }
}

struct Job {
    checks: Vec<ScriptCheck>,
    batch: Arc<Batch>,
}

pub struct CheckQueue {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    sigcache: Arc<SignatureCache>,
}

impl CheckQueue {
    /// Start `threads` workers. With zero threads every check runs on the
    /// caller when it is added.
    pub fn new(threads: usize, capacity: usize, sigcache: Arc<SignatureCache>) -> Self {
        if threads == 0 {
            return CheckQueue { sender: None, workers: Vec::new(), sigcache };
        }

        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(capacity.max(1));
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let cache = sigcache.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("scriptcheck-{}", i))
                .spawn(move || {
                    let checker = CachingChecker { cache: &cache, store: false };
                    while let Ok(job) = receiver.recv() {
                        job.batch.run(&job.checks, &checker);
                        job.batch.finish_one();
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => tracing::warn!("Failed to start script check thread {}: {}", i, e),
            }
        }

        if workers.is_empty() {
            return CheckQueue { sender: None, workers, sigcache };
        }
        tracing::info!("Using {} script verification threads", workers.len());
        CheckQueue { sender: Some(sender), workers, sigcache }
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn control(&self) -> CheckQueueControl<'_> {
        CheckQueueControl { queue: self, batch: Arc::new(Batch::default()), waited: false }
    }
}

impl Drop for CheckQueue {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// One block's worth of checks. Dropping without `wait` still waits.
pub struct CheckQueueControl<'a> {
    queue: &'a CheckQueue,
    batch: Arc<Batch>,
    waited: bool,
}

impl CheckQueueControl<'_> {
    pub fn add(&mut self, checks: Vec<ScriptCheck>) {
        if checks.is_empty() || self.batch.failed.load(Ordering::Acquire) {
            return;
        }
        let Some(sender) = &self.queue.sender else {
            let checker = CachingChecker { cache: &self.queue.sigcache, store: false };
            self.batch.run(&checks, &checker);
            return;
        };

        let mut checks = checks;
        while !checks.is_empty() {
            let rest = checks.split_off(checks.len().min(CHUNK_SIZE));
            *self.batch.pending.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            let job = Job { checks, batch: self.batch.clone() };
            if let Err(returned) = sender.send(job) {
                // Workers are gone, verify here instead.
                let job = returned.into_inner();
                let checker = CachingChecker { cache: &self.queue.sigcache, store: false };
                job.batch.run(&job.checks, &checker);
                job.batch.finish_one();
            }
            checks = rest;
        }
    }

    /// Block until every queued check has run; the first failure, if any.
    pub fn wait(mut self) -> Result<(), ScriptCheckError> {
        self.wait_inner()
    }

    fn wait_inner(&mut self) -> Result<(), ScriptCheckError> {
        self.waited = true;
        let mut pending = self.batch.pending.lock().unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            pending = self.batch.done.wait(pending).unwrap_or_else(|e| e.into_inner());
        }
        drop(pending);
        match self.batch.first_error.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for CheckQueueControl<'_> {
    fn drop(&mut self) {
        if !self.waited {
            let _ = self.wait_inner();
        }
    }
}
