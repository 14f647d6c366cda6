//! Parallel job orchestration.
//!
//! A fixed pool of `process-max` workers drains the job list; completions
//! are funneled back over a channel and applied to the manifest by the
//! single driver, in arrival order. A worker failure cancels the run
//! cooperatively: in-flight files finish, queued jobs are abandoned, and the
//! first error propagates.

use crate::layout::RepoLayout;
use crate::worker::{artifact_name, backup_file, BackupFileRequest, CopyResult, CopyResultTag};
use async_trait::async_trait;
use pgvault_common::{Error, Result};
use pgvault_manifest::Manifest;
use pgvault_protocol::ProtocolClient;
use pgvault_storage::Storage;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Executes one file-copy job somewhere: in-process or on a remote host.
#[async_trait]
pub trait FileExecutor: Send + Sync {
    async fn execute(&self, request: BackupFileRequest) -> Result<CopyResult>;
}

/// In-process execution against local (or locally-mounted) storage. The
/// blocking pipeline runs on the blocking pool.
pub struct LocalExecutor {
    pub source: Arc<dyn Storage>,
    pub repo: Arc<dyn Storage>,
    pub layout: RepoLayout,
    pub buffer_size: usize,
}

#[async_trait]
impl FileExecutor for LocalExecutor {
    async fn execute(&self, request: BackupFileRequest) -> Result<CopyResult> {
        let source = self.source.clone();
        let repo = self.repo.clone();
        let repo_path =
            format!("{}/{}", self.layout.partial_dir(&request.label), artifact_name(&request));
        let buffer_size = self.buffer_size;

        tokio::task::spawn_blocking(move || {
            backup_file(source.as_ref(), repo.as_ref(), &repo_path, &request, buffer_size)
        })
        .await
        .map_err(|err| Error::Assert(format!("copy task panicked: {err}")))?
    }
}

/// Execution over the subprocess protocol, one command per file.
pub struct RemoteExecutor {
    pub client: Arc<Mutex<ProtocolClient>>,
}

#[async_trait]
impl FileExecutor for RemoteExecutor {
    async fn execute(&self, request: BackupFileRequest) -> Result<CopyResult> {
        let out = self.client.lock().await.call("backupFile", request.to_param()).await?;
        CopyResult::from_out(&out)
    }
}

/// One queued copy job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub request: BackupFileRequest,
    /// Read from the standby rather than the primary.
    pub from_standby: bool,
}

/// Queue order: jobs grouped by containing directory for I/O locality,
/// largest first within a group so long files do not straggle at the end.
pub fn order_jobs(jobs: &mut [JobSpec]) {
    jobs.sort_by(|a, b| {
        let dir_a = a.request.repo_name.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        let dir_b = b.request.repo_name.rsplit_once('/').map(|(d, _)| d).unwrap_or("");

        dir_a
            .cmp(dir_b)
            .then(b.request.expected_size.cmp(&a.request.expected_size))
            .then(a.request.repo_name.cmp(&b.request.repo_name))
    });
}

/// Copy totals for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub copied: u32,
    pub skipped: u32,
    pub noop: u32,
    pub recopied: u32,
    pub checksum_match: u32,
    pub copy_bytes: u64,
    pub repo_bytes: u64,
}

impl RunStats {
    fn record(&mut self, result: &CopyResult) {
        match result.tag {
            CopyResultTag::Copied => self.copied += 1,
            CopyResultTag::Skipped => self.skipped += 1,
            CopyResultTag::Noop => self.noop += 1,
            CopyResultTag::Recopied => self.recopied += 1,
            CopyResultTag::ChecksumMatch => self.checksum_match += 1,
        }

        self.copy_bytes += result.copy_size;
        self.repo_bytes += result.repo_size;
    }
}

pub struct Orchestrator {
    pub process_max: u32,
    /// Copied bytes between checkpoint saves of the in-progress manifest.
    pub manifest_save_threshold: u64,
}

impl Orchestrator {
    /// Run all jobs and fold their results into the manifest. `save` is
    /// called with the manifest each time the save threshold worth of bytes
    /// has been applied, so an interrupted run stays resumable.
    pub async fn run(
        &self,
        manifest: &mut Manifest,
        mut jobs: Vec<JobSpec>,
        primary: Arc<dyn FileExecutor>,
        standby: Option<Arc<dyn FileExecutor>>,
        save: &mut dyn FnMut(&Manifest) -> Result<()>,
    ) -> Result<RunStats> {
        // One worker per repository path: a duplicate would mean two
        // writers racing on one artifact.
        let mut seen = HashSet::new();
        for job in &jobs {
            if !seen.insert(job.request.repo_name.clone()) {
                return Err(Error::Assert(format!(
                    "duplicate job for repository path '{}'",
                    job.request.repo_name
                )));
            }
        }

        order_jobs(&mut jobs);
        info!(jobs = jobs.len(), workers = self.process_max, "dispatching copy jobs");

        let semaphore = Arc::new(Semaphore::new(self.process_max.max(1) as usize));
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel::<(String, Result<CopyResult>)>(
            (self.process_max as usize).max(1) * 2,
        );

        for job in jobs {
            let executor = if job.from_standby {
                standby
                    .clone()
                    .ok_or_else(|| Error::Assert("standby job without a standby executor".into()))?
            } else {
                primary.clone()
            };

            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };

                // Cooperative cancellation at file boundaries.
                if cancel.load(Ordering::SeqCst) {
                    return;
                }

                let name = job.request.repo_name.clone();
                let result = executor.execute(job.request).await;
                let _ = tx.send((name, result)).await;
            });
        }
        drop(tx);

        let mut stats = RunStats::default();
        let mut first_error: Option<Error> = None;
        let mut bytes_since_save = 0u64;

        while let Some((name, result)) = rx.recv().await {
            match result {
                Err(err) => {
                    if first_error.is_none() {
                        warn!(file = %name, "copy failed: {err}");
                        cancel.store(true, Ordering::SeqCst);
                        first_error = Some(err);
                    }
                }
                Ok(result) => {
                    if first_error.is_some() {
                        continue; // draining
                    }

                    self.apply_result(manifest, &name, &result)?;
                    stats.record(&result);
                    bytes_since_save += result.copy_size;

                    if bytes_since_save >= self.manifest_save_threshold {
                        save(manifest)?;
                        bytes_since_save = 0;
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(
                    copied = stats.copied,
                    noop = stats.noop,
                    checksum_match = stats.checksum_match,
                    skipped = stats.skipped,
                    bytes = stats.copy_bytes,
                    "copy complete"
                );
                Ok(stats)
            }
        }
    }

    fn apply_result(
        &self,
        manifest: &mut Manifest,
        name: &str,
        result: &CopyResult,
    ) -> Result<()> {
        if result.tag == CopyResultTag::Skipped {
            warn!(file = %name, "file was removed during the backup");
            manifest.remove_file(name);
            return Ok(());
        }

        let entry = manifest.file_mut(name)?;

        match result.tag {
            CopyResultTag::Noop => {
                // Unchanged: the bytes stay in the referenced prior backup.
                if entry.reference.is_none() {
                    return Err(Error::Assert(format!(
                        "noop result for '{name}' which references no prior backup"
                    )));
                }
                entry.checksum = result.checksum.clone();
                entry.repo_size = Some(0);
            }
            CopyResultTag::Copied | CopyResultTag::Recopied | CopyResultTag::ChecksumMatch => {
                entry.size = result.copy_size;
                entry.repo_size = Some(result.repo_size);
                entry.checksum = result.checksum.clone();
                entry.reference = None;
            }
            CopyResultTag::Skipped => unreachable!(),
        }

        if let Some(pages) = &result.page_result {
            entry.checksum_page = Some(pages.valid);
            entry.checksum_page_error =
                (!pages.error.is_empty()).then(|| pages.error.clone());
        }

        debug!(file = %name, tag = result.tag.as_str(), "result applied");
        Ok(())
    }
}
