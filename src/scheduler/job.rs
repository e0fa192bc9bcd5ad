use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::error::{DdlError, Result};

/// Format version written into every job record by this process.
pub const CURRENT_VERSION: i64 = 1;

/// The kind of schema change a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    CreateSchema,
    DropSchema,
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    ModifyColumn,
    AddIndex,
    DropIndex,
    AddForeignKey,
    DropForeignKey,
    TruncateTable,
    RebaseAutoId,
    RenameTable,
    SetDefaultValue,
    ShardRowId,
    ModifyTableComment,
    RenameIndex,
}

impl JobType {
    pub const ALL: [JobType; 18] = [
        JobType::CreateSchema,
        JobType::DropSchema,
        JobType::CreateTable,
        JobType::DropTable,
        JobType::AddColumn,
        JobType::DropColumn,
        JobType::ModifyColumn,
        JobType::AddIndex,
        JobType::DropIndex,
        JobType::AddForeignKey,
        JobType::DropForeignKey,
        JobType::TruncateTable,
        JobType::RebaseAutoId,
        JobType::RenameTable,
        JobType::SetDefaultValue,
        JobType::ShardRowId,
        JobType::ModifyTableComment,
        JobType::RenameIndex,
    ];

    /// Schema-level jobs conflict with every job touching the same schema.
    pub fn is_schema_level(&self) -> bool {
        matches!(self, JobType::CreateSchema | JobType::DropSchema)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobType::CreateSchema => "create schema",
            JobType::DropSchema => "drop schema",
            JobType::CreateTable => "create table",
            JobType::DropTable => "drop table",
            JobType::AddColumn => "add column",
            JobType::DropColumn => "drop column",
            JobType::ModifyColumn => "modify column",
            JobType::AddIndex => "add index",
            JobType::DropIndex => "drop index",
            JobType::AddForeignKey => "add foreign key",
            JobType::DropForeignKey => "drop foreign key",
            JobType::TruncateTable => "truncate table",
            JobType::RebaseAutoId => "rebase auto_increment ID",
            JobType::RenameTable => "rename table",
            JobType::SetDefaultValue => "set default value",
            JobType::ShardRowId => "shard row ID",
            JobType::ModifyTableComment => "modify table comment",
            JobType::RenameIndex => "rename index",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Cancelling,
    Cancelled,
    RollingBack,
    RollbackDone,
    Done,
    Synced,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Cancelling => write!(f, "cancelling"),
            JobState::Cancelled => write!(f, "cancelled"),
            JobState::RollingBack => write!(f, "rollingback"),
            JobState::RollbackDone => write!(f, "rollback done"),
            JobState::Done => write!(f, "done"),
            JobState::Synced => write!(f, "synced"),
        }
    }
}

/// Visibility phase of the object a job is changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchemaState {
    #[default]
    None,
    DeleteOnly,
    WriteOnly,
    WriteReorganization,
    Public,
}

impl std::fmt::Display for SchemaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaState::None => write!(f, "none"),
            SchemaState::DeleteOnly => write!(f, "delete only"),
            SchemaState::WriteOnly => write!(f, "write only"),
            SchemaState::WriteReorganization => write!(f, "write reorganization"),
            SchemaState::Public => write!(f, "public"),
        }
    }
}

/// Change-event payload filled in when a job finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinlogInfo {
    pub schema_version: i64,
    pub finished_ts: u64,
    /// Snapshot of the changed object, if the handler recorded one.
    pub table_info: Option<Value>,
}

impl BinlogInfo {
    pub fn add_table_info(&mut self, schema_version: i64, table_info: Value) {
        self.schema_version = schema_version;
        self.table_info = Some(table_info);
    }

    /// Drops everything but the finish timestamp to shrink the record.
    pub fn clean(&mut self) {
        self.schema_version = 0;
        self.table_info = None;
    }
}

/// Immutable record paired with each schema version increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub version: i64,
    pub job_type: JobType,
    pub schema_id: i64,
    pub table_id: i64,
    /// Set for truncate, where the table gets a new ID.
    pub old_table_id: i64,
    /// Set for rename across schemas.
    pub old_schema_id: i64,
}

/// A queued schema change and its execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub schema_id: i64,
    pub table_id: i64,
    pub state: JobState,
    pub schema_state: SchemaState,
    /// Typed arguments, populated either by the submitter or by the first
    /// `decode_args` call on this instance.
    #[serde(skip)]
    pub args: Option<Vec<Value>>,
    pub raw_args: Option<Box<RawValue>>,
    pub dependency_id: i64,
    pub error: Option<String>,
    pub error_count: i64,
    pub snapshot_ver: u64,
    pub start_ts: u64,
    pub query: String,
    pub binlog_info: BinlogInfo,
    pub version: i64,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_type: JobType, schema_id: i64, table_id: i64) -> Self {
        Self {
            id: 0,
            job_type,
            schema_id,
            table_id,
            state: JobState::Queued,
            schema_state: SchemaState::None,
            args: Some(Vec::new()),
            raw_args: None,
            dependency_id: 0,
            error: None,
            error_count: 0,
            snapshot_ver: 0,
            start_ts: 0,
            query: String::new(),
            binlog_info: BinlogInfo::default(),
            version: CURRENT_VERSION,
            finished_at: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Decodes the positional arguments into `T` (usually a tuple).
    ///
    /// The raw form is parsed at most once per instance; later calls reuse
    /// the cached typed arguments so in-memory edits are not lost.
    pub fn decode_args<T: DeserializeOwned>(&mut self) -> Result<T> {
        if self.args.is_none() {
            let parsed: Vec<Value> = match &self.raw_args {
                Some(raw) => serde_json::from_str(raw.get())?,
                None => Vec::new(),
            };
            self.args = Some(parsed);
        }
        let args = self.args.clone().unwrap_or_default();
        Ok(serde_json::from_value(Value::Array(args))?)
    }

    /// True when raw args exist but were never decoded on this instance.
    pub fn args_undecoded(&self) -> bool {
        self.raw_args.is_some() && self.args.is_none()
    }

    /// Serializes the job record. With `update_raw_args`, typed arguments
    /// (if any) replace the stored raw form first.
    pub fn encode(&mut self, update_raw_args: bool) -> Result<Vec<u8>> {
        if update_raw_args {
            if let Some(args) = &self.args {
                let raw = serde_json::to_string(args)?;
                self.raw_args = Some(RawValue::from_string(raw)?);
            }
        }
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Job> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_cancelling(&self) -> bool {
        self.state == JobState::Cancelling
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == JobState::Cancelled
    }

    pub fn is_rolling_back(&self) -> bool {
        self.state == JobState::RollingBack
    }

    pub fn is_rollback_done(&self) -> bool {
        self.state == JobState::RollbackDone
    }

    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }

    pub fn is_synced(&self) -> bool {
        self.state == JobState::Synced
    }

    /// No further handler work is needed; only finalization remains.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            JobState::Done | JobState::RollbackDone | JobState::Cancelled
        )
    }

    /// States after which other members may have observed a new schema.
    pub fn may_change_schema(&self) -> bool {
        matches!(
            self.state,
            JobState::Running | JobState::RollingBack | JobState::Done | JobState::RollbackDone
        )
    }

    /// Whether a cancel request can still be honoured. Drop jobs that
    /// already hid their object are past the point of no return.
    pub fn is_rollbackable(&self) -> bool {
        if matches!(
            self.state,
            JobState::Done | JobState::Synced | JobState::Cancelled | JobState::RollbackDone
        ) {
            return false;
        }
        match self.job_type {
            JobType::DropSchema
            | JobType::DropTable
            | JobType::DropColumn
            | JobType::DropIndex
            | JobType::DropForeignKey => self.schema_state != SchemaState::DeleteOnly,
            _ => true,
        }
    }

    /// A background backfill is associated with this job.
    pub fn is_reorg_in_progress(&self) -> bool {
        self.snapshot_ver != 0
    }

    /// Whether `self` must not run concurrently with `other`.
    ///
    /// Jobs conflict when either is a schema-level job on the same schema
    /// (including the source schema of a rename), or when they target the
    /// same table.
    pub fn is_dependent_on(&mut self, other: &mut Job) -> Result<bool> {
        if self.has_dependent_schema(other)? || other.has_dependent_schema(self)? {
            return Ok(true);
        }
        Ok(self.table_id != 0 && self.table_id == other.table_id)
    }

    fn has_dependent_schema(&mut self, other: &Job) -> Result<bool> {
        if !other.job_type.is_schema_level() {
            return Ok(false);
        }
        if other.schema_id == self.schema_id {
            return Ok(true);
        }
        if self.job_type == JobType::RenameTable {
            let (old_schema_id,): (i64,) = self.decode_args()?;
            if other.schema_id == old_schema_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Records a failure on the job.
    pub fn record_error(&mut self, err: &DdlError) {
        self.error = Some(err.to_string());
        self.error_count += 1;
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arg_len = self.args.as_ref().map(|a| a.len()).unwrap_or(0);
        write!(
            f,
            "ID:{}, Type:{}, State:{}, SchemaState:{}, SchemaID:{}, TableID:{}, ArgLen:{}, StartTS:{}",
            self.id,
            self.job_type,
            self.state,
            self.schema_state,
            self.schema_id,
            self.table_id,
            arg_len,
            self.start_ts
        )
    }
}
