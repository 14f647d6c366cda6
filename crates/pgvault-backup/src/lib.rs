//! The pgvault backup engine.
//!
//! While a live PostgreSQL cluster runs, this crate negotiates start/stop
//! backup, walks the cluster into a manifest, streams every file through
//! the checksum/compression/encryption pipeline into the repository in
//! parallel, reuses prior and interrupted backups where safe, and publishes
//! the result atomically.

pub mod archive;
pub mod config;
pub mod controller;
pub mod db;
pub mod handler;
pub mod layout;
pub mod orchestrator;
pub mod resume;
pub mod worker;

pub use config::BackupOptions;
pub use controller::{BackupContext, BackupController, BackupResult, StanzaInfo};
pub use db::{
    DbAnswer, DbCall, DbClient, DbConnectConfig, DbInfo, ScriptedDb, StartBackupResult,
    StopBackupResult,
};
pub use handler::WorkerHandler;
pub use layout::RepoLayout;
pub use orchestrator::{
    FileExecutor, JobSpec, LocalExecutor, Orchestrator, RemoteExecutor, RunStats,
};
pub use resume::ResumeOutcome;
pub use worker::{backup_file, BackupFileRequest, CopyResult, CopyResultTag};
