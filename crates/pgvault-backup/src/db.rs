//! Database client interface.
//!
//! The controller is the only component that speaks to the cluster, and it
//! does so through this trait. The wire client lives elsewhere; tests drive
//! the controller with [`ScriptedDb`], which replays a declared sequence of
//! expected calls and canned responses and fails loudly on any drift.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pgvault_common::{Error, Result};
use pgvault_manifest::TablespaceInfo;
use pgvault_postgres::Lsn;
use std::collections::VecDeque;

/// Connection settings for a cluster, consumed by whichever wire client
/// implements [`DbClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct DbConnectConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub application_name: String,
}

impl Default for DbConnectConfig {
    fn default() -> Self {
        DbConnectConfig {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            database: "postgres".into(),
            application_name: "pgvault".into(),
        }
    }
}

/// Result of a start-backup call.
#[derive(Debug, Clone, PartialEq)]
pub struct StartBackupResult {
    pub lsn: Lsn,
    pub wal_segment: String,
    pub timeline: u32,
}

/// Result of a stop-backup call. The label and map blobs are only returned
/// by the non-exclusive protocol (9.6+); in exclusive mode the cluster
/// leaves `backup_label` on disk instead.
#[derive(Debug, Clone, PartialEq)]
pub struct StopBackupResult {
    pub lsn: Lsn,
    pub wal_segment: String,
    pub backup_label: Option<String>,
    pub tablespace_map: Option<String>,
    pub timestamp: i64,
}

/// A database in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct DbInfo {
    pub oid: u32,
    pub name: String,
}

/// Queries the backup controller issues against a cluster.
#[async_trait]
pub trait DbClient: Send + Sync {
    /// `server_version_num`, e.g. 90605.
    async fn server_version(&self) -> Result<u32>;

    /// Whether this connection landed on a standby.
    async fn is_standby(&self) -> Result<bool>;

    async fn current_time(&self) -> Result<DateTime<Utc>>;

    /// Try the stanza-scoped advisory lock. `false` means another backup
    /// holds it.
    async fn advisory_lock(&self) -> Result<bool>;

    async fn start_backup(
        &self,
        label: &str,
        start_fast: bool,
        exclusive: bool,
    ) -> Result<StartBackupResult>;

    async fn stop_backup(&self, exclusive: bool) -> Result<StopBackupResult>;

    /// Last replayed LSN on a standby.
    async fn replay_lsn(&self) -> Result<Lsn>;

    async fn database_list(&self) -> Result<Vec<DbInfo>>;

    async fn tablespace_list(&self) -> Result<Vec<TablespaceInfo>>;
}

/// One expected call in a [`ScriptedDb`] script.
#[derive(Debug, Clone, PartialEq)]
pub enum DbCall {
    ServerVersion,
    IsStandby,
    CurrentTime,
    AdvisoryLock,
    StartBackup { exclusive: bool },
    StopBackup { exclusive: bool },
    ReplayLsn,
    DatabaseList,
    TablespaceList,
}

/// Canned response for one scripted call.
#[derive(Debug, Clone)]
pub enum DbAnswer {
    Version(u32),
    Bool(bool),
    Time(DateTime<Utc>),
    Start(StartBackupResult),
    Stop(StopBackupResult),
    Lsn(Lsn),
    Databases(Vec<DbInfo>),
    Tablespaces(Vec<TablespaceInfo>),
    /// Simulate a query failure.
    Fail(String),
}

/// Mock client replaying a script of `(expected call, canned response)`
/// pairs. Out-of-order or unexpected calls fail the test immediately.
pub struct ScriptedDb {
    script: Mutex<VecDeque<(DbCall, DbAnswer)>>,
}

impl ScriptedDb {
    pub fn new(script: Vec<(DbCall, DbAnswer)>) -> Self {
        ScriptedDb { script: Mutex::new(script.into()) }
    }

    fn next(&self, call: DbCall) -> Result<DbAnswer> {
        let mut script = self.script.lock();

        let (expected, answer) = script.pop_front().ok_or_else(|| {
            Error::Assert(format!("unexpected database call {call:?}: script is exhausted"))
        })?;

        if expected != call {
            return Err(Error::Assert(format!(
                "database call {call:?} does not match scripted {expected:?}"
            )));
        }

        if let DbAnswer::Fail(message) = answer {
            return Err(Error::Db(message));
        }

        Ok(answer)
    }

    /// Number of scripted calls not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

macro_rules! expect_answer {
    ($answer:expr, $variant:ident) => {
        match $answer {
            DbAnswer::$variant(value) => Ok(value),
            other => Err(Error::Assert(format!(
                "scripted answer {other:?} does not fit the call"
            ))),
        }
    };
}

#[async_trait]
impl DbClient for ScriptedDb {
    async fn server_version(&self) -> Result<u32> {
        expect_answer!(self.next(DbCall::ServerVersion)?, Version)
    }

    async fn is_standby(&self) -> Result<bool> {
        expect_answer!(self.next(DbCall::IsStandby)?, Bool)
    }

    async fn current_time(&self) -> Result<DateTime<Utc>> {
        expect_answer!(self.next(DbCall::CurrentTime)?, Time)
    }

    async fn advisory_lock(&self) -> Result<bool> {
        expect_answer!(self.next(DbCall::AdvisoryLock)?, Bool)
    }

    async fn start_backup(
        &self,
        _label: &str,
        _start_fast: bool,
        exclusive: bool,
    ) -> Result<StartBackupResult> {
        expect_answer!(self.next(DbCall::StartBackup { exclusive })?, Start)
    }

    async fn stop_backup(&self, exclusive: bool) -> Result<StopBackupResult> {
        expect_answer!(self.next(DbCall::StopBackup { exclusive })?, Stop)
    }

    async fn replay_lsn(&self) -> Result<Lsn> {
        expect_answer!(self.next(DbCall::ReplayLsn)?, Lsn)
    }

    async fn database_list(&self) -> Result<Vec<DbInfo>> {
        expect_answer!(self.next(DbCall::DatabaseList)?, Databases)
    }

    async fn tablespace_list(&self) -> Result<Vec<TablespaceInfo>> {
        expect_answer!(self.next(DbCall::TablespaceList)?, Tablespaces)
    }
}
