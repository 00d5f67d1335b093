//! Proof-of-work search and the mining job registry.
//!
//! A search is cooperatively cancellable: the job's flag is checked once per
//! attempt, never mid-hash. A job ends exactly once, as complete, cancelled
//! or failed, whichever is recorded first. Jobs stay in the registry after
//! they finish until `cleanup_completed_jobs` evicts them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::block::Block;
use crate::constants::PROGRESS_INTERVAL;
use crate::error::{LedgerError, Result};
use crate::pow::meets_difficulty;
use crate::transaction::TxRecord;

/// Observer invoked every `PROGRESS_INTERVAL` attempts with `(nonce, hash)`.
pub type Progress<'a> = &'a (dyn Fn(u64, &str) + Sync);

/// Everything the miner needs to assemble a candidate block.
#[derive(Clone, Debug)]
pub struct BlockTemplate {
    pub index: u64,
    pub previous_hash: String,
    pub transactions: Vec<TxRecord>,
    /// Falls back to the miner's own difficulty.
    pub difficulty: Option<u32>,
}

impl BlockTemplate {
    pub fn new(index: u64, previous_hash: impl Into<String>, transactions: Vec<TxRecord>) -> Self {
        Self {
            index,
            previous_hash: previous_hash.into(),
            transactions,
            difficulty: None,
        }
    }

    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = Some(difficulty);
        self
    }
}

/// Result of a search that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MineOutcome {
    Mined(Block),
    Cancelled { job_id: String, attempts: u64 },
}

impl MineOutcome {
    pub fn into_block(self) -> Option<Block> {
        match self {
            MineOutcome::Mined(block) => Some(block),
            MineOutcome::Cancelled { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MineOutcome::Cancelled { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub job_id: String,
    pub block_index: u64,
    pub difficulty: u32,
    pub attempts: u64,
    pub elapsed_secs: f64,
    pub current_hash: String,
    pub is_complete: bool,
    pub is_cancelled: bool,
    pub is_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const RUNNING: u8 = 0;
const COMPLETE: u8 = 1;
const CANCELLED: u8 = 2;
const FAILED: u8 = 3;

/// One in-flight or finished search. Written by the worker, read and
/// cancelled from request handlers.
#[derive(Debug)]
pub struct MiningJob {
    job_id: String,
    block_index: u64,
    difficulty: u32,
    started: Instant,
    attempts: AtomicU64,
    current_hash: Mutex<String>,
    state: AtomicU8,
    result: Mutex<Option<Block>>,
    error: Mutex<Option<String>>,
}

impl MiningJob {
    fn new(job_id: &str, block_index: u64, difficulty: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            block_index,
            difficulty,
            started: Instant::now(),
            attempts: AtomicU64::new(0),
            current_hash: Mutex::new(String::new()),
            state: AtomicU8::new(RUNNING),
            result: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Marks a running job cancelled; the worker stops at its next attempt.
    /// False when the job had already finished.
    pub fn cancel(&self) -> bool {
        let cancelled = self.finish(CANCELLED);
        if cancelled {
            info!(job_id = %self.job_id, "mining job cancelled");
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == CANCELLED
    }

    pub fn is_complete(&self) -> bool {
        self.state() == COMPLETE
    }

    pub fn is_failed(&self) -> bool {
        self.state() == FAILED
    }

    pub fn is_finished(&self) -> bool {
        self.state() != RUNNING
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn result(&self) -> Option<Block> {
        self.result.lock().clone()
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.job_id.clone(),
            block_index: self.block_index,
            difficulty: self.difficulty,
            attempts: self.attempts(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            current_hash: self.current_hash.lock().clone(),
            is_complete: self.is_complete(),
            is_cancelled: self.is_cancelled(),
            is_failed: self.is_failed(),
            error: self.error.lock().clone(),
        }
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Moves a running job to `outcome`; only the first transition wins.
    fn finish(&self, outcome: u8) -> bool {
        self.state
            .compare_exchange(RUNNING, outcome, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn count_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn set_current_hash(&self, hash: &str) {
        let mut current = self.current_hash.lock();
        current.clear();
        current.push_str(hash);
    }

    /// False when a cancellation got in first; the block is then discarded.
    fn complete(&self, block: &Block) -> bool {
        // result is published before the state so a complete job always has one
        *self.result.lock() = Some(block.clone());
        if !self.finish(COMPLETE) {
            *self.result.lock() = None;
            return false;
        }
        self.set_current_hash(&block.hash);
        info!(job_id = %self.job_id, "mining job completed");
        true
    }

    fn fail(&self, error: &LedgerError) {
        *self.error.lock() = Some(error.to_string());
        if !self.finish(FAILED) {
            *self.error.lock() = None;
        }
    }

    fn cancelled_outcome(&self) -> MineOutcome {
        MineOutcome::Cancelled {
            job_id: self.job_id.clone(),
            attempts: self.attempts(),
        }
    }
}

/// Handle to a search running on its own worker thread.
pub struct MiningHandle {
    job: Arc<MiningJob>,
    worker: JoinHandle<()>,
}

impl MiningHandle {
    pub fn job_id(&self) -> &str {
        self.job.job_id()
    }

    pub fn job(&self) -> &Arc<MiningJob> {
        &self.job
    }

    pub fn cancel(&self) -> bool {
        self.job.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Waits for the worker (and its completion callback) to return.
    pub fn join(self) -> Result<()> {
        self.worker
            .join()
            .map_err(|_| LedgerError::Worker(format!("worker for job {} panicked", self.job.job_id)))
    }
}

/// Proof-of-work engine. Cheap to clone; clones share the job registry.
#[derive(Clone, Debug)]
pub struct Miner {
    difficulty: Arc<AtomicU32>,
    parallel: bool,
    jobs: Arc<RwLock<HashMap<String, Arc<MiningJob>>>>,
}

impl Miner {
    pub fn new(difficulty: u32) -> Self {
        info!(difficulty, "miner initialized");
        Self {
            difficulty: Arc::new(AtomicU32::new(difficulty)),
            parallel: false,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Search the nonce space on the rayon pool instead of one thread.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty.load(Ordering::Relaxed)
    }

    pub fn set_difficulty(&self, difficulty: u32) {
        self.difficulty.store(difficulty, Ordering::Relaxed);
        info!(difficulty, "mining difficulty set");
    }

    /// Builds the block described by `template` and searches for a nonce
    /// whose header hash meets the difficulty. When `job_id` is given the
    /// search is registered and can be observed and cancelled through it.
    pub fn mine_block(
        &self,
        template: BlockTemplate,
        job_id: Option<&str>,
        progress: Option<Progress<'_>>,
    ) -> Result<MineOutcome> {
        let difficulty = template.difficulty.unwrap_or_else(|| self.difficulty());
        let job = job_id
            .map(|id| self.register_job(id, template.index, difficulty))
            .transpose()?;
        let block = Block::new(
            template.index,
            template.previous_hash,
            template.transactions,
            difficulty,
        );
        self.search(block, job.as_deref(), progress)
    }

    /// Runs `mine_block` on a dedicated worker and hands the outcome to
    /// `callback` there. The job is registered before this returns, so it
    /// can be polled or cancelled immediately.
    pub fn mine_block_async<F>(
        &self,
        template: BlockTemplate,
        job_id: &str,
        callback: F,
    ) -> Result<MiningHandle>
    where
        F: FnOnce(Result<MineOutcome>) + Send + 'static,
    {
        let difficulty = template.difficulty.unwrap_or_else(|| self.difficulty());
        let job = self.register_job(job_id, template.index, difficulty)?;
        let block = Block::new(
            template.index,
            template.previous_hash,
            template.transactions,
            difficulty,
        );

        let miner = self.clone();
        let worker_job = Arc::clone(&job);
        let worker = thread::Builder::new()
            .name(format!("miner-{job_id}"))
            .spawn(move || {
                let outcome = miner.search(block, Some(&worker_job), None);
                callback(outcome);
            })
            .map_err(|e| {
                self.jobs.write().remove(job_id);
                LedgerError::Worker(e.to_string())
            })?;

        info!(job_id, "mining started on background worker");
        Ok(MiningHandle { job, worker })
    }

    pub fn get_job(&self, job_id: &str) -> Option<Arc<MiningJob>> {
        self.jobs.read().get(job_id).cloned()
    }

    pub fn get_job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.read().get(job_id).map(|job| job.status())
    }

    pub fn get_all_jobs(&self) -> BTreeMap<String, JobStatus> {
        self.jobs
            .read()
            .iter()
            .map(|(id, job)| (id.clone(), job.status()))
            .collect()
    }

    /// False when the job is unknown or already finished.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.jobs
            .read()
            .get(job_id)
            .is_some_and(|job| job.cancel())
    }

    /// Evicts complete and cancelled jobs, returning how many were removed.
    pub fn cleanup_completed_jobs(&self) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_finished());
        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed, "cleaned up finished mining jobs");
        }
        removed
    }

    /// Expected seconds to find a block at `hash_rate` hashes per second.
    pub fn estimate_time(difficulty: u32, hash_rate: f64) -> f64 {
        16f64.powi(difficulty as i32) / hash_rate
    }

    pub fn verify_proof_of_work(block: &Block) -> bool {
        crate::pow::verify_proof_of_work(block)
    }

    fn register_job(&self, job_id: &str, block_index: u64, difficulty: u32) -> Result<Arc<MiningJob>> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(job_id) {
            return Err(LedgerError::JobExists(job_id.to_string()));
        }
        let job = Arc::new(MiningJob::new(job_id, block_index, difficulty));
        jobs.insert(job_id.to_string(), Arc::clone(&job));
        Ok(job)
    }

    fn search(&self, block: Block, job: Option<&MiningJob>, progress: Option<Progress<'_>>) -> Result<MineOutcome> {
        let index = block.index();
        let difficulty = block.difficulty();
        info!(index, difficulty, parallel = self.parallel, "mining block");

        let start = Instant::now();
        let mut outcome = if self.parallel {
            search_parallel(block, job, progress)
        } else {
            search_sequential(block, job, progress)
        };

        // a cancel that lands after the winning hash still takes precedence
        if let Some(job) = job {
            let superseded = matches!(&outcome, Ok(MineOutcome::Mined(block)) if !job.complete(block));
            if superseded {
                outcome = Ok(job.cancelled_outcome());
            }
        }

        match &outcome {
            Ok(MineOutcome::Mined(block)) => {
                info!(
                    "Mined block {} with nonce {} and hash {}... in {:.2}s",
                    index,
                    block.header.nonce,
                    &block.hash[..16],
                    start.elapsed().as_secs_f64()
                );
            }
            Ok(MineOutcome::Cancelled { attempts, .. }) => {
                info!(index, attempts, "mining cancelled");
            }
            Err(e) => {
                warn!(index, error = %e, "mining failed");
                if let Some(job) = job {
                    job.fail(e);
                }
            }
        }
        outcome
    }
}

fn search_sequential(mut block: Block, job: Option<&MiningJob>, progress: Option<Progress<'_>>) -> Result<MineOutcome> {
    let difficulty = block.difficulty();
    let mut nonce: u64 = 0;
    loop {
        if let Some(job) = job.filter(|job| job.is_cancelled()) {
            return Ok(job.cancelled_outcome());
        }

        block.header.nonce = nonce;
        let hash = block.calculate_hash();

        if let Some(job) = job {
            job.count_attempt();
            job.set_current_hash(&hash);
        }
        if let Some(progress) = progress {
            if nonce % PROGRESS_INTERVAL == 0 {
                progress(nonce, &hash);
            }
        }

        if meets_difficulty(&hash, difficulty) {
            block.hash = hash;
            return Ok(MineOutcome::Mined(block));
        }

        nonce = nonce
            .checked_add(1)
            .ok_or_else(|| LedgerError::Worker("nonce space exhausted".to_string()))?;
    }
}

fn search_parallel(mut block: Block, job: Option<&MiningJob>, progress: Option<Progress<'_>>) -> Result<MineOutcome> {
    let difficulty = block.difficulty();
    let base_header = block.header.clone();
    let is_cancelled = || job.is_some_and(MiningJob::is_cancelled);

    // Rayon splits the whole nonce range across the pool; a raised
    // cancellation flag short-circuits every worker.
    let found = (0u64..u64::MAX).into_par_iter().find_any(|nonce| {
        if is_cancelled() {
            return true;
        }
        let mut header = base_header.clone();
        header.nonce = *nonce;
        let hash = header.hash();

        if let Some(job) = job {
            job.count_attempt();
        }
        if nonce % PROGRESS_INTERVAL == 0 {
            if let Some(job) = job {
                job.set_current_hash(&hash);
            }
            if let Some(progress) = progress {
                progress(*nonce, &hash);
            }
        }
        meets_difficulty(&hash, difficulty)
    });

    if let Some(job) = job.filter(|job| job.is_cancelled()) {
        return Ok(job.cancelled_outcome());
    }
    let nonce = found.ok_or_else(|| LedgerError::Worker("nonce space exhausted".to_string()))?;
    block.header.nonce = nonce;
    block.hash = block.calculate_hash();
    Ok(MineOutcome::Mined(block))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::pow::verify_proof_of_work;
    use crate::transaction::Transaction;

    fn template(difficulty: u32) -> BlockTemplate {
        let tx = Transaction::new("Alice", "Bob", 10, 0).with_id("tx1");
        BlockTemplate::new(1, "0".repeat(64), vec![tx.into()]).with_difficulty(difficulty)
    }

    #[test]
    fn miner_initialization() {
        let miner = Miner::new(4);
        assert_eq!(miner.difficulty(), 4);
        miner.set_difficulty(2);
        assert_eq!(miner.difficulty(), 2);
    }

    #[test]
    fn mine_block_with_low_difficulty() {
        let miner = Miner::new(2);
        let block = miner
            .mine_block(template(2), None, None)
            .unwrap()
            .into_block()
            .unwrap();
        assert_eq!(block.difficulty(), 2);
        assert!(block.hash.starts_with("00"));
        assert!(verify_proof_of_work(&block));
        assert!(Miner::verify_proof_of_work(&block));
    }

    #[test]
    fn template_difficulty_defaults_to_miner() {
        let miner = Miner::new(1);
        let tx = Transaction::new("A", "B", 1, 0);
        let block = miner
            .mine_block(BlockTemplate::new(3, "0".repeat(64), vec![tx.into()]), None, None)
            .unwrap()
            .into_block()
            .unwrap();
        assert_eq!(block.difficulty(), 1);
        assert_eq!(block.index(), 3);
    }

    #[test]
    fn parallel_search_finds_valid_block() {
        let miner = Miner::new(2).with_parallel(true);
        let block = miner
            .mine_block(template(2), Some("par"), None)
            .unwrap()
            .into_block()
            .unwrap();
        assert!(verify_proof_of_work(&block));
        let status = miner.get_job_status("par").unwrap();
        assert!(status.is_complete);
        assert!(status.attempts >= 1);
    }

    #[test]
    fn job_tracks_attempts_and_completion() {
        let miner = Miner::new(2);
        let block = miner
            .mine_block(template(2), Some("job-1"), None)
            .unwrap()
            .into_block()
            .unwrap();
        let status = miner.get_job_status("job-1").unwrap();
        assert!(status.is_complete);
        assert!(!status.is_cancelled);
        assert_eq!(status.attempts, block.header.nonce + 1);
        assert_eq!(status.current_hash, block.hash);
        assert_eq!(status.block_index, 1);
        assert_eq!(miner.get_job("job-1").unwrap().result(), Some(block));
    }

    #[test]
    fn duplicate_job_id_is_rejected() {
        let miner = Miner::new(1);
        miner.mine_block(template(1), Some("dup"), None).unwrap();
        assert_eq!(
            miner.mine_block(template(1), Some("dup"), None),
            Err(LedgerError::JobExists("dup".into()))
        );
    }

    #[test]
    fn progress_callback_fires_on_cadence() {
        let miner = Miner::new(0);
        let seen = AtomicU64::new(0);
        let progress = |nonce: u64, hash: &str| {
            assert_eq!(nonce % PROGRESS_INTERVAL, 0);
            assert_eq!(hash.len(), 64);
            seen.fetch_add(1, Ordering::Relaxed);
        };
        // difficulty 0 accepts the very first hash, at nonce 0
        miner.mine_block(template(0), None, Some(&progress)).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cancel_async_job_before_completion() {
        let miner = Miner::new(64);
        let (tx, rx) = mpsc::channel();
        // 64 leading zeros is unreachable, so the search only ends by cancellation
        let handle = miner
            .mine_block_async(template(64), "slow", move |outcome| {
                tx.send(outcome).unwrap();
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while handle.job().attempts() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(miner.cancel_job("slow"));
        let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
        handle.join().unwrap();

        assert!(outcome.is_cancelled());
        let status = miner.get_job_status("slow").unwrap();
        assert!(status.is_cancelled);
        assert!(!status.is_complete);
        assert!(status.attempts > 0);
    }

    #[test]
    fn cancel_after_winning_hash_discards_the_block() {
        let miner = Miner::new(0);
        let cancelled = AtomicU64::new(0);
        let progress = |_: u64, _: &str| {
            if miner.cancel_job("late") {
                cancelled.fetch_add(1, Ordering::Relaxed);
            }
        };
        // difficulty 0 qualifies at nonce 0, right after the progress call
        let outcome = miner
            .mine_block(template(0), Some("late"), Some(&progress))
            .unwrap();

        assert_eq!(cancelled.load(Ordering::Relaxed), 1);
        assert!(outcome.is_cancelled());
        let status = miner.get_job_status("late").unwrap();
        assert!(status.is_cancelled);
        assert!(!status.is_complete);
        assert!(miner.get_job("late").unwrap().result().is_none());
    }

    #[test]
    fn job_finishes_exactly_once() {
        let job = MiningJob::new("once", 1, 2);
        assert!(job.cancel());
        assert!(!job.cancel());
        let block = Block::new(1, "0".repeat(64), Vec::new(), 0);
        assert!(!job.complete(&block));
        job.fail(&LedgerError::Worker("late failure".into()));
        let status = job.status();
        assert!(status.is_cancelled);
        assert!(!status.is_complete);
        assert!(!status.is_failed);
        assert_eq!(status.error, None);
    }

    #[test]
    fn failed_job_is_not_reported_as_cancelled() {
        let job = MiningJob::new("broken", 1, 2);
        job.fail(&LedgerError::Worker("nonce space exhausted".into()));
        let status = job.status();
        assert!(status.is_failed);
        assert!(!status.is_cancelled);
        assert!(!status.is_complete);
        assert_eq!(
            status.error.as_deref(),
            Some("mining worker failed: nonce space exhausted")
        );
        assert!(job.is_finished());
        assert!(!job.cancel());
    }

    #[test]
    fn cancel_parallel_job() {
        let miner = Miner::new(64).with_parallel(true);
        let (tx, rx) = mpsc::channel();
        let handle = miner
            .mine_block_async(template(64), "par-slow", move |outcome| {
                tx.send(outcome).unwrap();
            })
            .unwrap();
        assert!(handle.cancel());
        let outcome = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
        handle.join().unwrap();
        assert!(outcome.is_cancelled());
    }

    #[test]
    fn async_job_completes_and_reports_block() {
        let miner = Miner::new(1);
        let (tx, rx) = mpsc::channel();
        let handle = miner
            .mine_block_async(template(1), "fast", move |outcome| {
                tx.send(outcome).unwrap();
            })
            .unwrap();
        assert_eq!(handle.job_id(), "fast");
        let block = rx
            .recv_timeout(Duration::from_secs(10))
            .unwrap()
            .unwrap()
            .into_block()
            .unwrap();
        handle.join().unwrap();
        assert!(verify_proof_of_work(&block));
        assert!(!miner.cancel_job("fast"), "complete jobs cannot be cancelled");
    }

    #[test]
    fn cleanup_evicts_only_finished_jobs() {
        let miner = Miner::new(1);
        miner.mine_block(template(1), Some("done"), None).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = miner
            .mine_block_async(template(64), "running", move |outcome| {
                tx.send(outcome).unwrap();
            })
            .unwrap();

        assert_eq!(miner.cleanup_completed_jobs(), 1);
        assert!(miner.get_job_status("done").is_none());
        assert!(miner.get_job_status("running").is_some());
        assert_eq!(miner.get_all_jobs().len(), 1);

        handle.cancel();
        rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
        handle.join().unwrap();
        assert_eq!(miner.cleanup_completed_jobs(), 1);
        assert!(miner.get_all_jobs().is_empty());
    }

    #[test]
    fn unknown_job() {
        let miner = Miner::new(1);
        assert!(miner.get_job_status("nope").is_none());
        assert!(!miner.cancel_job("nope"));
    }

    #[test]
    fn estimate_time_scales_by_sixteen() {
        assert_eq!(Miner::estimate_time(0, 1000.0), 0.001);
        assert_eq!(Miner::estimate_time(2, 256.0), 1.0);
    }
}
