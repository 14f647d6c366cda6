//! Protocol-side worker dispatch.
//!
//! The remote end of the subprocess protocol: a [`WorkerHandler`] receives
//! `backupFile` commands and runs the same copy worker the local executors
//! use, so local and remote execution share one contract.

use crate::layout::RepoLayout;
use crate::worker::{artifact_name, backup_file, BackupFileRequest};
use async_trait::async_trait;
use pgvault_common::{Error, Result};
use pgvault_protocol::CommandHandler;
use pgvault_storage::Storage;
use serde_json::Value;
use std::sync::Arc;

pub struct WorkerHandler {
    pub source: Arc<dyn Storage>,
    pub repo: Arc<dyn Storage>,
    pub layout: RepoLayout,
    pub buffer_size: usize,
}

#[async_trait]
impl CommandHandler for WorkerHandler {
    async fn handle(&self, cmd: &str, param: Vec<Value>) -> Result<Vec<Value>> {
        match cmd {
            "backupFile" => {
                let request = BackupFileRequest::from_param(&param)?;
                let repo_path = format!(
                    "{}/{}",
                    self.layout.partial_dir(&request.label),
                    artifact_name(&request)
                );

                let source = self.source.clone();
                let repo = self.repo.clone();
                let buffer_size = self.buffer_size;

                let result = tokio::task::spawn_blocking(move || {
                    backup_file(source.as_ref(), repo.as_ref(), &repo_path, &request, buffer_size)
                })
                .await
                .map_err(|err| Error::Assert(format!("copy task panicked: {err}")))??;

                Ok(result.to_out())
            }
            other => Err(Error::Protocol(format!("unknown command '{other}'"))),
        }
    }
}
