//! End-to-end scheduling tests on a single owner.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use ddl_scheduler::error::{DdlError, Result};
use ddl_scheduler::meta::{MemStore, Meta};
use ddl_scheduler::node::Ddl;
use ddl_scheduler::owner::StaticOwner;
use ddl_scheduler::scheduler::{Job, JobState, JobType, SchemaState};
use ddl_scheduler::syncer::MemSchemaSyncer;
use ddl_scheduler::worker::staged::StagedHandler;
use ddl_scheduler::worker::{BinlogEmitter, HandlerContext, HandlerRegistry, JobHandler};

use test_harness::{
    assert_eventually, fast_handlers, run_to_completion, test_config, TestCluster, TEST_LEASE,
};

/// Fails the first `failures` runs, then behaves like [`StagedHandler`].
struct Flaky {
    failures: usize,
    runs: AtomicUsize,
}

impl Flaky {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            runs: AtomicUsize::new(0),
        }
    }
}

impl JobHandler for Flaky {
    fn execute(&self, ctx: &HandlerContext<'_>, meta: &mut Meta<'_>, job: &mut Job) -> Result<i64> {
        if self.runs.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(DdlError::Handler("region unavailable".to_string()));
        }
        StagedHandler.execute(ctx, meta, job)
    }
}

/// Panics on its first run.
struct PanicOnce {
    runs: AtomicUsize,
}

impl JobHandler for PanicOnce {
    fn execute(&self, ctx: &HandlerContext<'_>, meta: &mut Meta<'_>, job: &mut Job) -> Result<i64> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("handler blew up");
        }
        StagedHandler.execute(ctx, meta, job)
    }
}

#[derive(Default)]
struct CountingBinlog {
    events: AtomicUsize,
}

impl BinlogEmitter for CountingBinlog {
    fn emit_ddl_event(&self, _start_ts: u64, _job: &Job) {
        self.events.fetch_add(1, Ordering::SeqCst);
    }
}

fn single_owner(handlers: HandlerRegistry) -> (Ddl, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    let ddl = Ddl::builder(
        test_config("solo"),
        store.clone(),
        Arc::new(StaticOwner::new("solo", true)),
        Arc::new(MemSchemaSyncer::new(TEST_LEASE * 4)),
    )
    .handlers(handlers)
    .build();
    (ddl, store)
}

#[tokio::test]
async fn test_create_table_lifecycle() {
    let cluster = TestCluster::new(1, fast_handlers);
    let node = cluster.node(0);

    let id = node
        .ddl
        .submit(Job::new(JobType::CreateTable, 1, 10).with_query("CREATE TABLE t (id INT)"))
        .unwrap();
    let queued = node.ddl.get_status(id).unwrap();
    assert_eq!(queued.state, JobState::Queued);
    assert_eq!(queued.dependency_id, 0);

    cluster.start();
    let job = node.ddl.wait_job_done(id).await.unwrap();

    assert_eq!(job.state, JobState::Synced);
    assert_eq!(job.schema_state, SchemaState::Public);
    assert!(job.finished_at.is_some());
    assert_eq!(
        node.callback.states(id),
        vec![JobState::Running, JobState::Done, JobState::Synced]
    );
    assert_eq!(node.ddl.history_jobs(10).unwrap().len(), 1);
    assert!(node.ddl.all_jobs().unwrap().is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_conflicting_jobs_run_in_order() {
    let cluster = TestCluster::new(1, fast_handlers);
    let node = cluster.node(0);

    let add = node
        .ddl
        .submit(Job::new(JobType::AddColumn, 1, 10).with_args(vec![json!("c1")]))
        .unwrap();
    let other = node.ddl.submit(Job::new(JobType::CreateTable, 1, 20)).unwrap();
    let drop = node
        .ddl
        .submit(Job::new(JobType::DropColumn, 1, 10).with_args(vec![json!("c1")]))
        .unwrap();

    assert_eq!(node.ddl.get_status(other).unwrap().dependency_id, 0);
    assert_eq!(node.ddl.get_status(drop).unwrap().dependency_id, add);

    cluster.start();
    let finished = node.ddl.wait_job_done(drop).await.unwrap();
    assert_eq!(finished.state, JobState::Synced);

    let add_synced = node.callback.first_index(add, JobState::Synced).unwrap();
    let drop_running = node.callback.first_index(drop, JobState::Running).unwrap();
    assert!(add_synced < drop_running, "drop ran before add was archived");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_ids_strictly_increase() {
    let cluster = TestCluster::new(2, fast_handlers);
    let mut last = 0;
    for i in 0..10 {
        let node = cluster.node(i % 2);
        let id = node.ddl.submit(Job::new(JobType::CreateTable, 1, i as i64)).unwrap();
        assert!(id > last);
        last = id;
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_do_ddl_job_reports_outcome() {
    let handlers = HandlerRegistry::new().register(JobType::CreateTable, Arc::new(StagedHandler));
    let (ddl, _store) = single_owner(handlers);
    ddl.start();

    let ok = ddl.do_ddl_job(Job::new(JobType::CreateTable, 1, 1)).await.unwrap();
    assert_eq!(ok.state, JobState::Synced);

    let err = ddl
        .do_ddl_job(Job::new(JobType::RenameIndex, 1, 1))
        .await
        .unwrap_err();
    match err {
        DdlError::CancelledJob(reason) => assert!(reason.starts_with("Invalid DDL job")),
        other => panic!("unexpected error: {other}"),
    }

    ddl.stop().await;
}

#[tokio::test]
async fn test_handler_errors_are_retried() {
    let handlers = HandlerRegistry::new().register(JobType::CreateTable, Arc::new(Flaky::new(3)));
    let (ddl, _store) = single_owner(handlers);
    ddl.start();

    let job = tokio::time::timeout(
        Duration::from_secs(5),
        ddl.do_ddl_job(Job::new(JobType::CreateTable, 1, 1)),
    )
    .await
    .expect("job should finish")
    .unwrap();
    assert_eq!(job.state, JobState::Synced);
    assert_eq!(job.error_count, 3);

    ddl.stop().await;
}

#[tokio::test]
async fn test_worker_survives_handler_panic() {
    let handlers = HandlerRegistry::new().register(
        JobType::CreateTable,
        Arc::new(PanicOnce {
            runs: AtomicUsize::new(0),
        }),
    );
    let (ddl, _store) = single_owner(handlers);
    ddl.start();

    let job = tokio::time::timeout(
        Duration::from_secs(5),
        ddl.do_ddl_job(Job::new(JobType::CreateTable, 1, 1)),
    )
    .await
    .expect("job should finish after the panic")
    .unwrap();
    assert_eq!(job.state, JobState::Synced);
    assert_eq!(ddl.panic_count(), 1);

    ddl.stop().await;
}

#[tokio::test]
async fn test_every_schema_version_has_a_diff() {
    let cluster = TestCluster::new(1, fast_handlers);
    cluster.start();
    let ddl = &cluster.node(0).ddl;

    run_to_completion(ddl, Job::new(JobType::CreateSchema, 2, 0)).await;
    run_to_completion(ddl, Job::new(JobType::AddColumn, 2, 5).with_args(vec![json!("c")])).await;
    run_to_completion(ddl, Job::new(JobType::TruncateTable, 2, 5).with_args(vec![json!(6)])).await;
    run_to_completion(ddl, Job::new(JobType::AddIndex, 2, 6).with_args(vec![json!("idx")])).await;

    {
        let mut txn = cluster.store.begin();
        let meta = Meta::new(&mut txn);
        let latest = meta.schema_version().unwrap();
        // 1 create schema + 3 add column + 1 truncate + 4 add index
        assert_eq!(latest, 9);

        let mut diffs = Vec::new();
        for version in 1..=latest {
            let diff = meta.schema_diff(version).unwrap();
            assert!(diff.is_some(), "missing diff for version {version}");
            diffs.extend(diff);
        }
        let truncate = diffs
            .iter()
            .find(|d| d.job_type == JobType::TruncateTable)
            .expect("truncate should write a diff");
        assert_eq!(truncate.table_id, 6);
        assert_eq!(truncate.old_table_id, 5);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_binlog_events_and_range_deletion() {
    let store = Arc::new(MemStore::new());
    let binlog = Arc::new(CountingBinlog::default());
    let ddl = Ddl::builder(
        test_config("solo"),
        store.clone(),
        Arc::new(StaticOwner::new("solo", true)),
        Arc::new(MemSchemaSyncer::new(TEST_LEASE * 4)),
    )
    .handlers(fast_handlers())
    .binlog_emitter(binlog.clone())
    .build();
    ddl.start();

    run_to_completion(&ddl, Job::new(JobType::CreateTable, 1, 1)).await;
    let dropped = run_to_completion(&ddl, Job::new(JobType::DropTable, 1, 1)).await;
    assert_eq!(dropped.state, JobState::Synced);
    assert_eq!(dropped.schema_state, SchemaState::None);
    assert_eq!(binlog.events.load(Ordering::SeqCst), 2);

    {
        let mut txn = store.begin();
        let meta = Meta::new(&mut txn);
        assert_eq!(meta.delete_range_jobs(), vec![dropped.id]);
    }

    ddl.stop().await;
}

#[tokio::test]
async fn test_lagging_member_does_not_block_progress() {
    let cluster = TestCluster::new(1, fast_handlers);
    let laggard = CancellationToken::new();
    let syncer = cluster.syncer.clone();
    let token = laggard.clone();
    let heartbeats = tokio::spawn(async move {
        while !token.is_cancelled() {
            syncer.heartbeat("laggard", 0);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    cluster.start();
    let ddl = &cluster.node(0).ddl;
    let job = run_to_completion(ddl, Job::new(JobType::AddColumn, 1, 3)).await;
    assert_eq!(job.state, JobState::Synced);

    let node = cluster.node(0);
    assert_eventually(
        || async { node.ddl.all_jobs().map(|jobs| jobs.is_empty()).unwrap_or(false) },
        Duration::from_secs(2),
        "queue should drain",
    )
    .await;

    laggard.cancel();
    let _ = heartbeats.await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_schema_changes_are_spaced_by_wait_time_when_a_member_lags() {
    let cluster = TestCluster::new(1, fast_handlers);
    let laggard = CancellationToken::new();
    let syncer = cluster.syncer.clone();
    let token = laggard.clone();
    let heartbeats = tokio::spawn(async move {
        while !token.is_cancelled() {
            syncer.heartbeat("laggard", 0);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    cluster.start();
    let node = cluster.node(0);
    let job = run_to_completion(&node.ddl, Job::new(JobType::AddColumn, 1, 3)).await;
    assert_eq!(job.state, JobState::Synced);

    // None -> DeleteOnly -> WriteOnly -> Public, each step bumping the version.
    let updates = node.callback.update_times(job.id);
    assert!(updates.len() >= 3, "expected three steps, got {}", updates.len());
    let wait_time = node.ddl.config().wait_time();
    for pair in updates[..3].windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= wait_time, "steps {gap:?} apart, expected at least {wait_time:?}");
    }

    laggard.cancel();
    let _ = heartbeats.await;
    cluster.shutdown().await;
}
