//! Resume analysis for interrupted backups.
//!
//! A prior run that died after StartBackup leaves a `.partial` directory
//! with a checkpointed manifest copy. When the saved attempt is compatible
//! with the current plan, its completed artifacts are verified and reused;
//! everything else in the directory is garbage and is removed.

use crate::layout::RepoLayout;
use pgvault_common::{CompressionType, Result};
use pgvault_manifest::ini::{manifest_version, ENGINE_VERSION};
use pgvault_manifest::{file_index, Manifest, MANIFEST_COPY_FILE, MANIFEST_FILE};
use pgvault_storage::{Storage, StorageType};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Result of an accepted resume.
#[derive(Debug, Default)]
pub struct ResumeOutcome {
    /// Plan-manifest file name → checksum recorded by the interrupted
    /// attempt. The copy worker verifies each before keeping the artifact.
    pub resumable: HashMap<String, String>,
    /// A kept artifact had a timestamp mismatch; the whole backup runs in
    /// delta mode.
    pub enable_delta: bool,
}

/// Find the newest partial backup directory, if any.
fn find_partial(repo: &dyn Storage, layout: &RepoLayout) -> Result<Option<String>> {
    let mut labels: Vec<String> = repo
        .list(&layout.backup_root())?
        .into_iter()
        .filter_map(|info| RepoLayout::partial_label(&info.name).map(String::from))
        .collect();

    labels.sort();
    Ok(labels.pop())
}

fn reject(repo: &dyn Storage, layout: &RepoLayout, label: &str, reason: &str) -> Result<()> {
    warn!(label = label, "partial backup cannot be resumed ({reason}), removing");
    repo.remove_recurse(&layout.partial_dir(label))
}

/// Check whether an interrupted backup can seed the current plan.
///
/// On acceptance the partial directory is renamed to the new label and the
/// surviving artifacts are reported for per-file verification. On rejection
/// the partial directory is removed and the backup starts clean.
pub fn check(
    repo: &dyn Storage,
    layout: &RepoLayout,
    plan: &Manifest,
    resume_enabled: bool,
) -> Result<Option<ResumeOutcome>> {
    let Some(saved_label) = find_partial(repo, layout)? else {
        return Ok(None);
    };

    if !resume_enabled {
        reject(repo, layout, &saved_label, "resume is disabled")?;
        return Ok(None);
    }

    let saved_dir = layout.partial_dir(&saved_label);
    let primary_text = repo.read_all(&layout.manifest(&saved_dir)).ok();
    let copy_text = repo.read_all(&layout.manifest_copy(&saved_dir)).ok();

    let raw_text = match (&primary_text, &copy_text) {
        (Some(text), _) | (None, Some(text)) => String::from_utf8_lossy(text).into_owned(),
        (None, None) => {
            reject(repo, layout, &saved_label, "no manifest was saved")?;
            return Ok(None);
        }
    };

    match manifest_version(&raw_text) {
        Some(version) if version == ENGINE_VERSION => {}
        _ => {
            reject(repo, layout, &saved_label, "it was made by a different version")?;
            return Ok(None);
        }
    }

    let saved = match Manifest::load_with_fallback(
        primary_text.as_deref().map(|t| std::str::from_utf8(t).unwrap_or("")),
        copy_text.as_deref().map(|t| std::str::from_utf8(t).unwrap_or("")),
    ) {
        Ok(saved) => saved,
        Err(err) => {
            reject(repo, layout, &saved_label, &format!("its manifest is unusable: {err}"))?;
            return Ok(None);
        }
    };

    if saved.backup.prior != plan.backup.prior {
        reject(repo, layout, &saved_label, "it has a different prior backup")?;
        return Ok(None);
    }

    if saved.options.compress_type != plan.options.compress_type {
        reject(repo, layout, &saved_label, "it used a different compression type")?;
        return Ok(None);
    }

    if saved.options.cipher_type != plan.options.cipher_type {
        reject(repo, layout, &saved_label, "it used a different cipher type")?;
        return Ok(None);
    }

    if saved.backup.backup_type != plan.backup.backup_type {
        reject(repo, layout, &saved_label, "it is a different backup type")?;
        return Ok(None);
    }

    info!(
        from = %saved_label,
        to = %plan.backup.label,
        "resuming interrupted backup"
    );

    // Adopt the directory under the new label, then classify its content.
    let new_dir = layout.partial_dir(&plan.backup.label);
    repo.rename(&saved_dir, &new_dir)?;

    Ok(Some(classify(repo, &new_dir, &saved, plan)?))
}

/// Walk the adopted directory and decide, artifact by artifact, what is
/// reusable. Everything removed here is cheap to recreate or impossible to
/// trust.
fn classify(
    repo: &dyn Storage,
    backup_dir: &str,
    saved: &Manifest,
    plan: &Manifest,
) -> Result<ResumeOutcome> {
    let mut outcome = ResumeOutcome::default();
    let saved_files = file_index(saved);
    let plan_files = file_index(plan);
    let compress = saved.options.compress_type;

    for info in repo.list_recurse(backup_dir)? {
        let artifact = format!("{backup_dir}/{}", info.name);

        match info.storage_type {
            StorageType::Path => {
                let known = plan.path_list().iter().any(|p| p.name == info.name)
                    || plan.target(&info.name).is_some()
                    || plan
                        .target_list()
                        .iter()
                        .any(|t| t.name.starts_with(&format!("{}/", info.name)));
                if !known {
                    debug!(path = %info.name, "removing path not in the new backup");
                    repo.remove_recurse(&artifact)?;
                }
                continue;
            }
            StorageType::File => {}
            // Nothing but files and paths belongs in a repository.
            StorageType::Link | StorageType::Special => {
                debug!(name = %info.name, "removing special file from partial backup");
                repo.remove(&artifact)?;
                continue;
            }
        }

        if info.name == MANIFEST_FILE || info.name == MANIFEST_COPY_FILE {
            continue;
        }

        // Map the artifact back to its manifest name via the compression
        // extension; a mismatched extension cannot belong to this attempt.
        let name = match compress {
            CompressionType::None => Some(info.name.as_str()),
            _ => info.name.strip_suffix(&format!(".{}", compress.extension())),
        };

        let Some(name) = name else {
            debug!(name = %info.name, "removing artifact with mismatched compression extension");
            repo.remove(&artifact)?;
            continue;
        };

        let Some(saved_entry) = saved_files.get(name) else {
            debug!(name = %name, "removing artifact unknown to the saved manifest");
            repo.remove(&artifact)?;
            continue;
        };

        // Referenced files live in the prior backup; a local artifact for
        // one is garbage from before the reference was decided.
        if saved_entry.reference.is_some() {
            repo.remove(&artifact)?;
            continue;
        }

        if saved_entry.checksum.is_empty() {
            debug!(name = %name, "removing artifact whose copy never completed");
            repo.remove(&artifact)?;
            continue;
        }

        let Some(plan_entry) = plan_files.get(name) else {
            debug!(name = %name, "removing artifact not in the new backup");
            repo.remove(&artifact)?;
            continue;
        };

        if plan_entry.size != saved_entry.size {
            debug!(name = %name, "removing artifact with changed size");
            repo.remove(&artifact)?;
            continue;
        }

        if plan_entry.timestamp != saved_entry.timestamp {
            debug!(name = %name, "removing artifact with changed timestamp");
            repo.remove(&artifact)?;
            outcome.enable_delta = true;
            continue;
        }

        // Zero-length files are cheaper to re-make than to verify.
        if plan_entry.size == 0 {
            repo.remove(&artifact)?;
            continue;
        }

        outcome.resumable.insert(name.to_string(), saved_entry.checksum.clone());
    }

    info!(reusable = outcome.resumable.len(), "resume classification complete");
    Ok(outcome)
}
