//! Top-level backup controller.
//!
//! Drives one backup through its states:
//!
//! ```text
//! Init → OptionReconcile → ConnectPrimary [→ ConnectStandby] → StartBackup
//!      → BuildManifest → Dispatch → StopBackup → FinalizeManifest
//!      → ArchiveCheck → Publish → Done
//! ```
//!
//! Failures before StartBackup leave no repository state; failures after it
//! leave a `.partial` directory the next run's resume analyzer picks up.

use crate::archive::wait_for_archive;
use crate::config::BackupOptions;
use crate::db::{DbClient, StartBackupResult};
use crate::layout::RepoLayout;
use crate::orchestrator::{FileExecutor, JobSpec, LocalExecutor, Orchestrator, RunStats};
use crate::resume;
use crate::worker::{store_blob, BackupFileRequest};
use chrono::{DateTime, Utc};
use pgvault_common::{backup_label, label_full_part, label_type, BackupType, Error, Result};
use pgvault_manifest::{
    build, file_index, BackupSection, BuildOptions, DbSection, FileEntry, Manifest, OptionSection,
    TablespaceInfo, TARGET_PG_DATA,
};
use pgvault_postgres::version::{
    version_major, version_to_str, PgVersion, PG_VERSION_84, PG_VERSION_BACKUP_NON_EXCLUSIVE,
    PG_VERSION_BACKUP_STANDBY,
};
use pgvault_postgres::{is_relation_file, segment_page_offset, Lsn, PgControl};
use pgvault_storage::Storage;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Identity the stanza was configured for. The cluster must match.
#[derive(Debug, Clone, Copy)]
pub struct StanzaInfo {
    pub version: PgVersion,
    pub system_id: u64,
}

/// Everything a backup needs. Connections are owned by the controller;
/// workers never touch the database.
pub struct BackupContext {
    pub options: BackupOptions,
    /// Repository storage, rooted above the stanza.
    pub repo: Arc<dyn Storage>,
    /// Cluster storage, rooted at the data directory.
    pub pg: Arc<dyn Storage>,
    /// Absolute data directory path, recorded as the `pg_data` target.
    pub pg_path: PathBuf,
    /// Standby cluster storage when backup-standby is on.
    pub standby_pg: Option<Arc<dyn Storage>>,
    /// Primary connection; `None` only for offline backups.
    pub primary: Option<Arc<dyn DbClient>>,
    pub standby: Option<Arc<dyn DbClient>>,
    pub stanza_info: StanzaInfo,
}

/// Outcome of a completed backup.
#[derive(Debug)]
pub struct BackupResult {
    pub label: String,
    pub backup_type: BackupType,
    pub manifest: Manifest,
    pub stats: RunStats,
}

pub struct BackupController {
    context: BackupContext,
    layout: RepoLayout,
}

impl BackupController {
    pub fn new(context: BackupContext) -> Self {
        let layout = RepoLayout::new(&context.options.stanza);
        BackupController { context, layout }
    }

    pub async fn run(self) -> Result<BackupResult> {
        let mut options = self.context.options.clone();
        let repo = self.context.repo.clone();
        let pg = self.context.pg.clone();

        // ---- OptionReconcile ------------------------------------------
        if !options.online {
            if options.archive_check {
                warn!("archive-check is not possible for an offline backup, resetting");
                options.archive_check = false;
            }
            if options.backup_standby {
                warn!("backup-standby is not possible for an offline backup, resetting");
                options.backup_standby = false;
            }

            if pg.exists("postmaster.pid")? {
                if options.force {
                    warn!("postmaster.pid exists but --force was given, continuing");
                } else {
                    return Err(Error::PostmasterRunning(
                        "postmaster.pid exists: shut the cluster down or use --force".into(),
                    ));
                }
            }
        }

        // ---- ConnectPrimary -------------------------------------------
        let stanza_info = self.context.stanza_info;
        let primary = if options.online {
            let primary = self
                .context
                .primary
                .clone()
                .ok_or_else(|| Error::Assert("online backup requires a primary connection".into()))?;

            let version = version_major(primary.server_version().await?);
            if version != stanza_info.version {
                return Err(Error::BackupMismatch(format!(
                    "cluster version {} does not match stanza version {}",
                    version_to_str(version),
                    version_to_str(stanza_info.version)
                )));
            }

            if primary.is_standby().await? {
                return Err(Error::Db("the primary connection landed on a standby".into()));
            }

            if !primary.advisory_lock().await? {
                return Err(Error::Db("another backup is already running for this stanza".into()));
            }

            Some(primary)
        } else {
            None
        };

        let version = stanza_info.version;

        if options.backup_standby && version < PG_VERSION_BACKUP_STANDBY {
            return Err(Error::OptionInvalid(format!(
                "backup-standby requires PostgreSQL {} or better",
                version_to_str(PG_VERSION_BACKUP_STANDBY)
            )));
        }

        if options.online && version < PG_VERSION_84 && options.start_fast {
            return Err(Error::OptionInvalid(format!(
                "start-fast is not supported before PostgreSQL {}",
                version_to_str(PG_VERSION_84)
            )));
        }

        // ---- ConnectStandby -------------------------------------------
        let standby = if options.backup_standby {
            let standby = self.context.standby.clone().ok_or_else(|| {
                Error::OptionInvalid("backup-standby requires a standby connection".into())
            })?;

            if !standby.is_standby().await? {
                return Err(Error::Db("the standby connection is not a standby".into()));
            }

            Some(standby)
        } else {
            None
        };

        // ---- Cluster identity -----------------------------------------
        let control = PgControl::from_bytes(&pg.read_all("global/pg_control")?)?;

        if control.version != stanza_info.version || control.system_id != stanza_info.system_id {
            return Err(Error::BackupMismatch(format!(
                "cluster {} (system id {}) does not match stanza {} (system id {})",
                version_to_str(control.version),
                control.system_id,
                version_to_str(stanza_info.version),
                stanza_info.system_id
            )));
        }

        let checksum_page = match options.checksum_page {
            None => control.page_checksum,
            Some(true) if !control.page_checksum => {
                return Err(Error::OptionInvalid(
                    "page checksums are not enabled in the cluster".into(),
                ))
            }
            Some(explicit) => explicit,
        };

        // ---- Backup type and prior ------------------------------------
        let published = self.published_backups()?;
        let mut backup_type = options.backup_type;

        let prior_label = match backup_type {
            BackupType::Full => None,
            BackupType::Differential => published
                .iter()
                .rev()
                .find(|label| matches!(label_type(label), Ok(BackupType::Full)))
                .cloned(),
            BackupType::Incremental => published.last().cloned(),
        };

        if backup_type != BackupType::Full && prior_label.is_none() {
            warn!("no prior backup exists, performing a full backup instead");
            backup_type = BackupType::Full;
        }
        let prior_label = if backup_type == BackupType::Full { None } else { prior_label };

        let prior_manifest = match &prior_label {
            Some(label) => Some(self.load_backup_manifest(label)?),
            None => None,
        };

        // A prior backup of a different cluster life cannot be built upon.
        let prior_mismatch = prior_manifest.as_ref().is_some_and(|prior| {
            prior.db.system_id != control.system_id
                || prior.db.version != version_to_str(control.version)
        });
        let (backup_type, prior_label, prior_manifest) = if prior_mismatch {
            warn!("prior backup is from a different cluster, performing a full backup instead");
            (BackupType::Full, None, None)
        } else {
            (backup_type, prior_label, prior_manifest)
        };

        // ---- Label ----------------------------------------------------
        let start_time = match &options.start_time {
            Some(time) => *time,
            None => match &primary {
                Some(primary) => primary.current_time().await?,
                None => Utc::now(),
            },
        };

        let prior_full = prior_label.as_deref().map(label_full_part).transpose()?;
        let existing = self.existing_labels()?;
        let label = backup_label(backup_type, prior_full, start_time, |candidate| {
            existing.contains(candidate)
        })?;

        info!(
            label = %label,
            backup_type = %backup_type,
            prior = prior_label.as_deref().unwrap_or("none"),
            "backup starting"
        );

        // ---- StartBackup ----------------------------------------------
        let exclusive = version < PG_VERSION_BACKUP_NON_EXCLUSIVE;
        let start = match &primary {
            Some(primary) => {
                Some(primary.start_backup(&label, options.start_fast, exclusive).await?)
            }
            None => None,
        };

        let copy_start = match &primary {
            Some(primary) => primary.current_time().await?,
            None => start_time,
        };

        // Standby replay must pass the start LSN before any file is read
        // from it.
        if let (Some(standby), Some(start)) = (&standby, &start) {
            wait_for_replay(standby.as_ref(), start.lsn, options.protocol_timeout).await?;
        }

        // ---- BuildManifest --------------------------------------------
        let tablespaces: Vec<TablespaceInfo> = match &primary {
            Some(primary) => primary.tablespace_list().await?,
            None => Vec::new(),
        };

        let mut manifest = self.new_manifest(
            &label,
            backup_type,
            prior_label.clone(),
            start_time,
            copy_start,
            &start,
            &control,
            &options,
            checksum_page,
        );

        let pg_path = self.context.pg_path.clone();
        let exclusions = options.exclusions.clone();
        let archive_copy = options.archive_copy;
        manifest = tokio::task::spawn_blocking(move || -> Result<Manifest> {
            build(
                &mut manifest,
                &pg_path,
                control.version,
                control.catalog_version,
                &tablespaces,
                &BuildOptions { archive_copy, exclusions, user: None, group: None },
            )?;
            Ok(manifest)
        })
        .await
        .map_err(|err| Error::Assert(format!("manifest build panicked: {err}")))??;

        let mut delta = options.delta;

        // Future timestamps make size/time comparison unreliable.
        let copy_start_epoch = copy_start.timestamp();
        for file in manifest.file_list() {
            if file.timestamp > copy_start_epoch {
                warn!(
                    file = %file.name,
                    "timestamp is later than the backup start, enabling delta checksums"
                );
                delta = true;
                break;
            }
        }

        // Inherit unchanged files from the prior backup as references.
        if let (Some(prior), Some(prior_label)) = (&prior_manifest, &prior_label) {
            let unchanged = inherited_files(&manifest, prior, prior_label);
            for (name, checksum, reference, page, page_error) in unchanged {
                manifest.set_reference(&name, &reference)?;
                let entry = manifest.file_mut(&name)?;
                entry.checksum = checksum;
                entry.checksum_page = page;
                entry.checksum_page_error = page_error;
            }
        }

        manifest.options.delta = delta;

        // ---- Resume ----------------------------------------------------
        let outcome = {
            let repo = repo.clone();
            let layout = self.layout.clone();
            let manifest_snapshot = manifest.clone();
            let resume_enabled = options.resume;
            tokio::task::spawn_blocking(move || {
                resume::check(repo.as_ref(), &layout, &manifest_snapshot, resume_enabled)
            })
            .await
            .map_err(|err| Error::Assert(format!("resume analysis panicked: {err}")))??
        }
        .unwrap_or_default();

        if outcome.enable_delta && !delta {
            warn!("resumed file timestamps changed, enabling delta checksums");
            delta = true;
            manifest.options.delta = true;
        }

        let partial_dir = self.layout.partial_dir(&label);
        repo.create_path(&partial_dir)?;

        // ---- Dispatch --------------------------------------------------
        let jobs = self.build_jobs(&manifest, &label, &options, &control, &start, delta, &outcome.resumable, checksum_page);

        let primary_executor: Arc<dyn FileExecutor> = Arc::new(LocalExecutor {
            source: pg.clone(),
            repo: repo.clone(),
            layout: self.layout.clone(),
            buffer_size: options.buffer_size,
        });
        let standby_executor: Option<Arc<dyn FileExecutor>> =
            self.context.standby_pg.clone().map(|source| {
                Arc::new(LocalExecutor {
                    source,
                    repo: repo.clone(),
                    layout: self.layout.clone(),
                    buffer_size: options.buffer_size,
                }) as Arc<dyn FileExecutor>
            });

        let orchestrator = Orchestrator {
            process_max: options.process_max,
            manifest_save_threshold: options.manifest_save_threshold,
        };

        let copy_path = self.layout.manifest_copy(&partial_dir);
        let mut save = |manifest: &Manifest| -> Result<()> {
            repo.write_atomic(&copy_path, manifest.to_text()?.as_bytes())
        };

        let stats = orchestrator
            .run(&mut manifest, jobs, primary_executor, standby_executor, &mut save)
            .await?;

        // ---- StopBackup ------------------------------------------------
        let stop_time = match &primary {
            Some(primary) => {
                let stop = primary.stop_backup(exclusive).await?;

                manifest.backup.lsn_stop = Some(stop.lsn.to_string());
                manifest.backup.archive_stop = Some(stop.wal_segment.clone());

                for (blob, name) in [
                    (&stop.backup_label, "backup_label"),
                    (&stop.tablespace_map, "tablespace_map"),
                ] {
                    if let Some(content) = blob {
                        self.store_stop_file(
                            &label,
                            &mut manifest,
                            name,
                            content.as_bytes(),
                            stop.timestamp,
                            &options,
                        )?;
                    }
                }

                stop.timestamp
            }
            None => copy_start.timestamp(),
        };

        // ---- FinalizeManifest ------------------------------------------
        manifest.backup.timestamp_stop = Some(stop_time);

        let text = manifest.to_text()?;
        repo.write_atomic(&self.layout.manifest(&partial_dir), text.as_bytes())?;
        repo.write_atomic(&self.layout.manifest_copy(&partial_dir), text.as_bytes())?;

        // ---- ArchiveCheck ----------------------------------------------
        if options.archive_check {
            if let Some(StartBackupResult { lsn, timeline, .. }) = &start {
                let stop_lsn: Lsn = manifest
                    .backup
                    .lsn_stop
                    .as_deref()
                    .ok_or_else(|| Error::Assert("stop backup recorded no LSN".into()))?
                    .parse()?;

                wait_for_archive(
                    repo.clone(),
                    &self.layout,
                    *timeline,
                    *lsn,
                    stop_lsn,
                    control.wal_segment_size,
                    options.archive_timeout,
                )
                .await?;
            }
        }

        // ---- Publish ---------------------------------------------------
        repo.rename(&partial_dir, &self.layout.backup_dir(&label))?;
        repo.symlink(&label, &self.layout.latest_link())?;

        info!(
            label = %label,
            size = manifest.total_size(),
            repo_size = manifest.repo_total_size(),
            "backup complete"
        );

        Ok(BackupResult { label, backup_type, manifest, stats })
    }

    /// Published backup labels, oldest first.
    fn published_backups(&self) -> Result<Vec<String>> {
        let mut labels: Vec<String> = self
            .context
            .repo
            .list(&self.layout.backup_root())?
            .into_iter()
            .filter(|info| RepoLayout::is_backup_label(&info.name))
            .filter(|info| {
                self.context
                    .repo
                    .exists(&self.layout.manifest(&self.layout.backup_dir(&info.name)))
                    .unwrap_or(false)
            })
            .map(|info| info.name)
            .collect();

        labels.sort();
        Ok(labels)
    }

    /// Every label-shaped name in the backup root, published or partial,
    /// for collision checks.
    fn existing_labels(&self) -> Result<std::collections::HashSet<String>> {
        Ok(self
            .context
            .repo
            .list(&self.layout.backup_root())?
            .into_iter()
            .map(|info| {
                RepoLayout::partial_label(&info.name).map(String::from).unwrap_or(info.name)
            })
            .collect())
    }

    fn load_backup_manifest(&self, label: &str) -> Result<Manifest> {
        let dir = self.layout.backup_dir(label);
        let primary = self.context.repo.read_all(&self.layout.manifest(&dir)).ok();
        let copy = self.context.repo.read_all(&self.layout.manifest_copy(&dir)).ok();

        Manifest::load_with_fallback(
            primary.as_deref().map(|t| std::str::from_utf8(t).unwrap_or("")),
            copy.as_deref().map(|t| std::str::from_utf8(t).unwrap_or("")),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new_manifest(
        &self,
        label: &str,
        backup_type: BackupType,
        prior: Option<String>,
        start_time: DateTime<Utc>,
        copy_start: DateTime<Utc>,
        start: &Option<StartBackupResult>,
        control: &PgControl,
        options: &BackupOptions,
        checksum_page: bool,
    ) -> Manifest {
        Manifest::new(
            BackupSection {
                label: label.to_string(),
                prior,
                backup_type,
                timestamp_start: start_time.timestamp(),
                timestamp_copy_start: copy_start.timestamp(),
                timestamp_stop: None,
                lsn_start: start.as_ref().map(|s| s.lsn.to_string()),
                lsn_stop: None,
                archive_start: start.as_ref().map(|s| s.wal_segment.clone()),
                archive_stop: None,
                extra: BTreeMap::new(),
            },
            OptionSection {
                archive_check: options.archive_check,
                archive_copy: options.archive_copy,
                backup_standby: options.backup_standby,
                buffer_size: options.buffer_size as u64,
                checksum_page,
                cipher_type: options.cipher_type,
                compress_type: options.compress_type,
                compress_level: options.compress_level,
                delta: options.delta,
                hardlink: options.hardlink,
                online: options.online,
                process_max: options.process_max,
                extra: BTreeMap::new(),
            },
            DbSection {
                version: version_to_str(control.version),
                system_id: control.system_id,
                catalog_version: control.catalog_version,
                extra: BTreeMap::new(),
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_jobs(
        &self,
        manifest: &Manifest,
        label: &str,
        options: &BackupOptions,
        control: &PgControl,
        start: &Option<StartBackupResult>,
        delta: bool,
        resumable: &std::collections::HashMap<String, String>,
        checksum_page: bool,
    ) -> Vec<JobSpec> {
        let lsn_limit = start.as_ref().map(|s| s.lsn.0).unwrap_or(0);
        let mut jobs = Vec::new();

        for file in manifest.file_list() {
            let referenced = file.reference.is_some();
            let resumed_checksum = resumable.get(&file.name);

            // A referenced file needs no work unless delta re-verifies it.
            if referenced && !delta {
                continue;
            }

            let relation = is_relation_file(&file.name);
            let expected_checksum = resumed_checksum.cloned().or_else(|| {
                ((referenced && delta) && !file.checksum.is_empty())
                    .then(|| file.checksum.clone())
            });

            jobs.push(JobSpec {
                request: BackupFileRequest {
                    source_name: source_name(&file.name),
                    ignore_missing: options.online,
                    expected_size: file.size,
                    copy_exact_size: options.online && relation,
                    expected_checksum,
                    check_pages: checksum_page && relation && file.size > 0,
                    page_lsn_limit: lsn_limit,
                    page_no_offset: segment_page_offset(&file.name, control.page_size),
                    repo_name: file.name.clone(),
                    has_reference: referenced,
                    compress_type: options.compress_type,
                    compress_level: options.compress_level,
                    label: label.to_string(),
                    delta,
                    cipher_type: options.cipher_type,
                    cipher_pass: options.cipher_pass.clone(),
                    page_size: control.page_size,
                    resumable: resumed_checksum.is_some(),
                },
                from_standby: options.backup_standby && !file.master,
            });
        }

        jobs
    }

    /// Store a blob returned by non-exclusive stop backup (`backup_label`,
    /// `tablespace_map`) as a synthesized cluster file.
    fn store_stop_file(
        &self,
        label: &str,
        manifest: &mut Manifest,
        name: &str,
        content: &[u8],
        timestamp: i64,
        options: &BackupOptions,
    ) -> Result<()> {
        let manifest_name = format!("{TARGET_PG_DATA}/{name}");

        let request = BackupFileRequest {
            source_name: String::new(),
            ignore_missing: false,
            expected_size: content.len() as u64,
            copy_exact_size: true,
            expected_checksum: None,
            check_pages: false,
            page_lsn_limit: 0,
            page_no_offset: 0,
            repo_name: manifest_name.clone(),
            has_reference: false,
            compress_type: options.compress_type,
            compress_level: options.compress_level,
            label: label.to_string(),
            delta: false,
            cipher_type: options.cipher_type,
            cipher_pass: options.cipher_pass.clone(),
            page_size: control_page_size_default(),
            resumable: false,
        };

        let repo_path = format!(
            "{}/{}",
            self.layout.partial_dir(label),
            crate::worker::artifact_name(&request)
        );
        let result = store_blob(self.context.repo.as_ref(), &repo_path, content, &request)?;

        let mut entry = FileEntry::new(manifest_name, result.copy_size, timestamp, &manifest.defaults);
        entry.checksum = result.checksum;
        entry.repo_size = Some(result.repo_size);
        entry.mode = 0o600;
        entry.master = true;
        manifest.add_file(entry)?;

        info!(file = name, size = content.len(), "stop backup file stored");
        Ok(())
    }
}

fn control_page_size_default() -> u32 {
    pgvault_postgres::PAGE_SIZE_DEFAULT as u32
}

/// Cluster path (relative to the data directory) for a manifest name.
/// Tablespace content is reached through its `pg_tblspc` link.
fn source_name(manifest_name: &str) -> String {
    match manifest_name.strip_prefix("pg_data/") {
        Some(rest) => rest.to_string(),
        None => manifest_name.to_string(),
    }
}

/// Unchanged files relative to the prior backup, with the attributes they
/// inherit: `(name, checksum, reference, checksum_page, page_error)`.
fn inherited_files(
    manifest: &Manifest,
    prior: &Manifest,
    prior_label: &str,
) -> Vec<(String, String, String, Option<bool>, Option<Vec<pgvault_postgres::PageRange>>)> {
    let prior_files = file_index(prior);
    let mut inherited = Vec::new();

    for file in manifest.file_list() {
        let Some(prior_entry) = prior_files.get(file.name.as_str()) else {
            continue;
        };

        if prior_entry.checksum.is_empty()
            || prior_entry.size != file.size
            || prior_entry.timestamp != file.timestamp
        {
            continue;
        }

        // The bytes live wherever the prior backup got them from.
        let reference =
            prior_entry.reference.clone().unwrap_or_else(|| prior_label.to_string());

        inherited.push((
            file.name.clone(),
            prior_entry.checksum.clone(),
            reference,
            prior_entry.checksum_page,
            prior_entry.checksum_page_error.clone(),
        ));
    }

    inherited
}

/// Poll the standby until it has replayed past `lsn`.
async fn wait_for_replay(standby: &dyn DbClient, lsn: Lsn, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        let replay = standby.replay_lsn().await?;
        if replay >= lsn {
            info!(replay = %replay, "standby has replayed past the backup start");
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(Error::ProtocolTimeout(format!(
                "standby replay {replay} did not reach backup start {lsn} within {timeout:?}"
            )));
        }

        sleep(Duration::from_millis(100)).await;
    }
}
