//! Job execution for the DDL owner.
//!
//! Everything here runs inside a metadata transaction supplied by the
//! worker loop in [`node`](crate::node):
//! - **Dispatch**: [`JobRunner`] moves the head job one step and writes it back
//! - **Handlers**: [`JobHandler`] implementations keyed by job type in a [`HandlerRegistry`]
//! - **Backfill**: [`ReorgCtx`] owns the one background reorganization task
//! - **Migration**: [`migrate`] empties the legacy queue once per owner
//!
//! # Step Flow
//!
//! 1. A head already `Done`/`RollbackDone` is finalized into history
//! 2. A `Cancelling` job without a backfill becomes `Cancelled`
//! 3. Otherwise the handler runs and returns the new schema version
//! 4. The job is written back; an oversized record is force-cancelled

pub mod handler;
pub mod hooks;
pub mod migrate;
pub mod reorg;
pub mod runner;
pub mod staged;

pub use handler::{update_schema_version, HandlerContext, HandlerRegistry, JobHandler};
pub use hooks::{BaseCallback, BinlogEmitter, Callback, Hooks, NoopBinlog, RangeDeleter, StoreRangeDeleter};
pub use reorg::{check_reorg_cancelled, ReorgCtx, ReorgStatus};
pub use runner::{JobRunner, Step};
