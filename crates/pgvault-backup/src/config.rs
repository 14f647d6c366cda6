//! Typed backup options.
//!
//! Options are a plain struct rather than a string-keyed map; the command
//! line for a remote worker is synthesized by [`BackupOptions::to_argv`],
//! which enumerates the keys a given host role needs. An unsupported key is
//! simply not a field here, so it cannot be smuggled through.

use chrono::{DateTime, Utc};
use pgvault_common::{BackupType, CipherType, CompressionType};
use pgvault_protocol::HostRole;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Stanza this backup belongs to.
    pub stanza: String,
    /// Requested backup type. May be downgraded to full when no prior
    /// backup supports the request.
    pub backup_type: BackupType,
    /// Online backup using start/stop backup. Offline requires the cluster
    /// to be shut down.
    pub online: bool,
    /// Allow an offline backup while the postmaster appears to be running.
    pub force: bool,
    /// Re-verify checksums against the cluster even when size and timestamp
    /// match the prior backup.
    pub delta: bool,
    /// Pick up a compatible interrupted backup instead of starting over.
    pub resume: bool,
    /// Verify data page checksums while copying. `None` follows the
    /// cluster's own setting.
    pub checksum_page: Option<bool>,
    pub compress_type: CompressionType,
    pub compress_level: u32,
    pub cipher_type: CipherType,
    pub cipher_pass: Option<String>,
    /// Number of parallel copy workers.
    pub process_max: u32,
    /// Read buffer size for the copy pipeline.
    pub buffer_size: usize,
    /// Verify the WAL needed by this backup reached the archive.
    pub archive_check: bool,
    /// Copy WAL segments into the backup itself.
    pub archive_copy: bool,
    /// Copy cluster files from a standby where possible.
    pub backup_standby: bool,
    /// Request a fast checkpoint on start backup.
    pub start_fast: bool,
    /// Record prior-backup files as hard links when publishing.
    pub hardlink: bool,
    /// Bytes copied between checkpoint saves of the in-progress manifest.
    pub manifest_save_threshold: u64,
    /// Per-round-trip timeout on the subprocess protocol.
    pub protocol_timeout: Duration,
    /// Total time to wait for WAL segments to be archived.
    pub archive_timeout: Duration,
    /// Extra cluster paths to exclude from the backup.
    pub exclusions: Vec<String>,
    /// Backup start time override. Tests pin this for deterministic labels;
    /// production leaves it unset and uses the database clock.
    pub start_time: Option<DateTime<Utc>>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            stanza: "main".into(),
            backup_type: BackupType::Full,
            online: true,
            force: false,
            delta: false,
            resume: true,
            checksum_page: None,
            compress_type: CompressionType::None,
            compress_level: 6,
            cipher_type: CipherType::None,
            cipher_pass: None,
            process_max: 1,
            buffer_size: 64 * 1024,
            archive_check: true,
            archive_copy: false,
            backup_standby: false,
            start_fast: false,
            hardlink: false,
            manifest_save_threshold: 1024 * 1024 * 1024,
            protocol_timeout: Duration::from_secs(60),
            archive_timeout: Duration::from_secs(60),
            exclusions: Vec::new(),
            start_time: None,
        }
    }
}

impl BackupOptions {
    /// Command line for a remote worker process in the given role. Database
    /// options stay home when the remote end is the repository, and vice
    /// versa.
    pub fn to_argv(&self, role: HostRole) -> Vec<String> {
        let mut argv = vec![
            "remote".to_string(),
            format!("--stanza={}", self.stanza),
            format!("--buffer-size={}", self.buffer_size),
            format!("--protocol-timeout={}", self.protocol_timeout.as_secs()),
        ];

        match role {
            HostRole::Repo => {
                argv.push(format!("--compress-type={}", self.compress_type));
                argv.push(format!("--compress-level={}", self.compress_level));
                argv.push(format!("--cipher-type={}", self.cipher_type));
            }
            HostRole::Db => {
                if let Some(checksum_page) = self.checksum_page {
                    argv.push(format!("--checksum-page={checksum_page}"));
                }
            }
        }

        argv
    }
}
