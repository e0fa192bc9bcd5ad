use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DdlConfig;
use crate::error::{DdlError, Result};
use crate::meta::{MemStore, Meta, QueueKind};
use crate::owner::OwnerManager;
use crate::scheduler::dependency::build_job_dependence;
use crate::scheduler::history::{get_history_job, history_jobs};
use crate::scheduler::job::{Job, JobState, CURRENT_VERSION};
use crate::scheduler::queue::JobQueue;
use crate::syncer::{wait_schema_changed, wait_schema_synced, SchemaSyncer};
use crate::worker::hooks::{BinlogEmitter, Callback, Hooks, RangeDeleter};
use crate::worker::migrate::drain_legacy_queue;
use crate::worker::runner::{JobRunner, Step};
use crate::worker::HandlerRegistry;

/// Per-ownership bookkeeping, reset whenever ownership is observed lost.
#[derive(Debug, Clone, Copy)]
struct Incarnation {
    legacy_drained: bool,
    resync_pending: bool,
}

impl Default for Incarnation {
    fn default() -> Self {
        Self {
            legacy_drained: false,
            resync_pending: true,
        }
    }
}

/// Result of one transaction of the drain pass.
enum Pass {
    NotOwner,
    Empty,
    Resync { job: Job, store_version: i64 },
    Step(Step),
}

struct DdlInner {
    config: DdlConfig,
    store: Arc<MemStore>,
    owner: Arc<dyn OwnerManager>,
    syncer: Arc<dyn SchemaSyncer>,
    runner: JobRunner,
    hooks: Arc<Hooks>,
    wake: Notify,
    job_done: Notify,
    shutdown: CancellationToken,
    panic_count: AtomicU64,
}

/// Assembles a [`Ddl`] from its collaborators.
pub struct DdlBuilder {
    config: DdlConfig,
    store: Arc<MemStore>,
    owner: Arc<dyn OwnerManager>,
    syncer: Arc<dyn SchemaSyncer>,
    handlers: HandlerRegistry,
    binlog: Option<Arc<dyn BinlogEmitter>>,
    range_deleter: Option<Arc<dyn RangeDeleter>>,
}

impl DdlBuilder {
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn binlog_emitter(mut self, binlog: Arc<dyn BinlogEmitter>) -> Self {
        self.binlog = Some(binlog);
        self
    }

    pub fn range_deleter(mut self, range_deleter: Arc<dyn RangeDeleter>) -> Self {
        self.range_deleter = Some(range_deleter);
        self
    }

    pub fn build(self) -> Ddl {
        let hooks = Arc::new(Hooks::default());
        let mut runner = JobRunner::new(self.config.owner_id.clone(), self.handlers, hooks.clone());
        if let Some(binlog) = self.binlog {
            runner = runner.with_binlog_emitter(binlog);
        }
        if let Some(range_deleter) = self.range_deleter {
            runner = runner.with_range_deleter(range_deleter);
        }
        Ddl {
            inner: Arc::new(DdlInner {
                config: self.config,
                store: self.store,
                owner: self.owner,
                syncer: self.syncer,
                runner,
                hooks,
                wake: Notify::new(),
                job_done: Notify::new(),
                shutdown: CancellationToken::new(),
                panic_count: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }
}

/// The DDL scheduler of one process.
///
/// Every process can submit jobs and poll their status. Only the process
/// its [`OwnerManager`] names as owner dispatches them, one at a time, from
/// the head of the shared queue.
pub struct Ddl {
    inner: Arc<DdlInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Ddl {
    pub fn builder(
        config: DdlConfig,
        store: Arc<MemStore>,
        owner: Arc<dyn OwnerManager>,
        syncer: Arc<dyn SchemaSyncer>,
    ) -> DdlBuilder {
        DdlBuilder {
            config,
            store,
            owner,
            syncer,
            handlers: HandlerRegistry::new(),
            binlog: None,
            range_deleter: None,
        }
    }

    /// Spawns the worker loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move {
            inner.run_worker().await;
        }));
        tracing::info!(owner_id = %self.inner.config.owner_id, "DDL worker started");
    }

    /// Stops the worker between passes and waits for it to exit.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.job_done.notify_waiters();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "DDL worker task ended abnormally");
            }
        }
        tracing::info!(owner_id = %self.inner.config.owner_id, "DDL worker stopped");
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.config.owner_id
    }

    pub fn config(&self) -> &DdlConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<MemStore> {
        &self.inner.store
    }

    /// Worker passes aborted by a panic since start.
    pub fn panic_count(&self) -> u64 {
        self.inner.panic_count.load(Ordering::Relaxed)
    }

    pub fn set_callback(&self, callback: Arc<dyn Callback>) {
        self.inner.hooks.set_callback(callback);
    }

    /// Durably enqueues `job` and returns its assigned ID.
    ///
    /// The ID, start timestamp and dependency are assigned in the same
    /// transaction that appends the job.
    pub fn submit(&self, job: Job) -> Result<i64> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DdlError::Closed);
        }
        let job = self.inner.store.run_in_txn(true, |txn| {
            let mut meta = Meta::new(txn);
            let mut job = job.clone();
            job.id = meta.gen_global_id()?;
            job.start_ts = meta.start_ts();
            job.state = JobState::Queued;
            job.version = CURRENT_VERSION;
            build_job_dependence(&mut meta, &mut job)?;
            JobQueue::new(&mut meta).enqueue(&mut job)?;
            Ok(job)
        })?;
        tracing::info!(job = %job, dependency_id = job.dependency_id, "Submitted DDL job");
        self.inner.wake.notify_one();
        Ok(job.id)
    }

    /// Current record of job `id`: the active queue first, then the legacy
    /// queue, then history.
    pub fn get_status(&self, id: i64) -> Result<Job> {
        let mut txn = self.inner.store.begin();
        let mut meta = Meta::new(&mut txn);
        for queue in [QueueKind::Current, QueueKind::Legacy] {
            meta.set_queue(queue);
            if let Some((_, job)) = JobQueue::new(&mut meta).find(id)? {
                return Ok(job);
            }
        }
        get_history_job(&meta, id)?.ok_or(DdlError::JobNotFound(id))
    }

    /// Requests cancellation of each job in `ids`.
    ///
    /// Returns one result per ID. Accepted jobs are marked `Cancelling` and
    /// the owner decides on its next step whether they end `Cancelled` or
    /// roll back.
    pub fn cancel_jobs(&self, ids: &[i64]) -> Result<Vec<Result<()>>> {
        let results = self.inner.store.run_in_txn(true, |txn| {
            let mut meta = Meta::new(txn);
            let mut queue = JobQueue::new(&mut meta);
            let mut results = Vec::with_capacity(ids.len());
            for &id in ids {
                let Some((index, mut job)) = queue.find(id)? else {
                    results.push(Err(DdlError::JobNotFound(id)));
                    continue;
                };
                if job.is_cancelled() || job.is_rollback_done() {
                    results.push(Err(DdlError::CancelledJob(format!("job {} already cancelled", id))));
                    continue;
                }
                if job.is_cancelling() || job.is_rolling_back() {
                    results.push(Err(DdlError::CancelledJob(format!("job {} is being cancelled", id))));
                    continue;
                }
                if !job.is_rollbackable() {
                    results.push(Err(DdlError::CannotCancel(id, format!("state {}", job.state))));
                    continue;
                }
                job.state = JobState::Cancelling;
                queue.update(index, &mut job, true)?;
                results.push(Ok(()));
            }
            Ok(results)
        })?;
        for (id, res) in ids.iter().zip(&results) {
            match res {
                Ok(()) => tracing::info!(job_id = id, "Cancel requested"),
                Err(e) => tracing::debug!(job_id = id, error = %e, "Cancel rejected"),
            }
        }
        self.inner.wake.notify_one();
        Ok(results)
    }

    /// Jobs not yet finished: the active queue, then any legacy leftovers.
    pub fn all_jobs(&self) -> Result<Vec<Job>> {
        let mut txn = self.inner.store.begin();
        let mut meta = Meta::new(&mut txn);
        let mut jobs = JobQueue::new(&mut meta).all()?;
        meta.set_queue(QueueKind::Legacy);
        jobs.extend(JobQueue::new(&mut meta).all()?);
        Ok(jobs)
    }

    /// Archived jobs, newest first.
    pub fn history_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let mut txn = self.inner.store.begin();
        let meta = Meta::new(&mut txn);
        history_jobs(&meta, limit)
    }

    /// Waits until job `id` is archived and returns the archived record.
    ///
    /// Completion is signalled locally when this process is the owner; the
    /// periodic check covers jobs finished by another process.
    pub async fn wait_job_done(&self, id: i64) -> Result<Job> {
        let interval = self.inner.config.check_interval();
        loop {
            let notified = self.inner.job_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let archived = {
                let mut txn = self.inner.store.begin();
                let meta = Meta::new(&mut txn);
                get_history_job(&meta, id)?
            };
            if let Some(job) = archived {
                return Ok(job);
            }
            if self.inner.shutdown.is_cancelled() {
                return Err(DdlError::Closed);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(interval) => {
                    tracing::debug!(job_id = id, "Re-checking DDL job status");
                }
            }
        }
    }

    /// Submits `job` and waits for it to finish. Jobs that end cancelled or
    /// rolled back return their recorded error.
    pub async fn do_ddl_job(&self, job: Job) -> Result<Job> {
        let id = self.submit(job)?;
        let job = self.wait_job_done(id).await?;
        if job.is_cancelled() || job.is_rollback_done() {
            let reason = job.error.clone().unwrap_or_else(|| format!("job {} cancelled", id));
            return Err(DdlError::CancelledJob(reason));
        }
        Ok(job)
    }
}

impl Drop for Ddl {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl DdlInner {
    async fn run_worker(self: Arc<Self>) {
        let check_interval = self.config.check_interval();
        let mut ticker = tokio::time::interval(check_interval);
        let mut incarnation = Incarnation::default();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::debug!(interval_ms = check_interval.as_millis() as u64, "Checking DDL job queue");
                }
                _ = self.wake.notified() => {}
            }

            let pass = AssertUnwindSafe(self.handle_job_queue(&mut incarnation))
                .catch_unwind()
                .await;
            match pass {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_transient() => {
                    tracing::debug!(error = %e, "DDL pass hit a conflict, retrying");
                    self.wake.notify_one();
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Handle DDL job queue failed");
                }
                Err(panic) => {
                    self.panic_count.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(panic = %panic_message(&*panic), "DDL worker pass panicked, resuming");
                    incarnation = Incarnation::default();
                }
            }
        }
        tracing::debug!(owner_id = %self.config.owner_id, "DDL worker loop exited");
    }

    /// Processes jobs until the queue is empty, ownership is lost, or a
    /// store error ends the pass.
    async fn handle_job_queue(&self, incarnation: &mut Incarnation) -> Result<()> {
        let wait_time = self.config.wait_time();
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            if !incarnation.legacy_drained {
                let drained = self.store.run_in_txn(false, |txn| {
                    if !self.owner.is_owner() {
                        return Ok(None);
                    }
                    drain_legacy_queue(&self.runner, &mut Meta::new(txn)).map(Some)
                })?;
                match drained {
                    Some(_) => incarnation.legacy_drained = true,
                    None => {
                        *incarnation = Incarnation::default();
                        return Ok(());
                    }
                }
            }

            let resync_pending = incarnation.resync_pending;
            let pass = self.store.run_in_txn(false, |txn| {
                if !self.owner.is_owner() {
                    return Ok(Pass::NotOwner);
                }
                let mut meta = Meta::new(txn);
                let Some(job) = JobQueue::new(&mut meta).peek_head()? else {
                    return Ok(Pass::Empty);
                };
                if resync_pending && !job.is_done() && !job.is_rollback_done() {
                    let store_version = meta.schema_version()?;
                    return Ok(Pass::Resync { job, store_version });
                }
                self.runner.step(&mut meta, job).map(Pass::Step)
            })?;

            let step = match pass {
                Pass::NotOwner => {
                    tracing::debug!(owner_id = %self.config.owner_id, "Not the DDL owner");
                    *incarnation = Incarnation::default();
                    return Ok(());
                }
                Pass::Empty => return Ok(()),
                Pass::Resync { job, store_version } => {
                    incarnation.resync_pending = false;
                    if job.may_change_schema() {
                        wait_schema_synced(self.syncer.as_ref(), wait_time, store_version).await;
                    }
                    self.wake.notify_one();
                    return Ok(());
                }
                Pass::Step(step) => step,
            };

            let mut reorg_pending = false;
            let (job, schema_version, finalized) = match step {
                Step::Finalized(job) => (job, 0, true),
                Step::Ran {
                    job,
                    schema_version,
                    error,
                } => {
                    reorg_pending = error.is_none()
                        && schema_version == 0
                        && self.runner.reorg().is_running(job.id);
                    if error.is_some() {
                        tracing::info!(
                            job_id = job.id,
                            backoff_ms = self.config.error_backoff.as_millis() as u64,
                            "Run DDL job failed, retrying after backoff"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                            _ = self.shutdown.cancelled() => {}
                        }
                    }
                    (job, schema_version, false)
                }
            };

            self.hooks.callback().on_job_updated(&job);

            if job.may_change_schema() {
                wait_schema_changed(self.syncer.as_ref(), wait_time, schema_version).await;
            }
            if finalized {
                self.job_done.notify_waiters();
            }
            if reorg_pending {
                tokio::select! {
                    _ = self.runner.reorg().wait_finished(self.config.check_interval()) => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
