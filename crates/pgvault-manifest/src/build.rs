//! Manifest construction from a cluster filesystem walk.

use crate::entry::{Defaults, FileEntry, LinkEntry, Owner, PathEntry, Target, TargetType};
use crate::manifest::{Manifest, TARGET_PG_DATA};
use pgvault_common::{Error, Result};
use pgvault_postgres::version::{tablespace_version_dir, wal_dir, PgVersion, PG_VERSION_90};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Files never backed up, by base name, wherever they appear.
const SKIP_FILES: &[&str] = &["postmaster.pid", "postmaster.opts", "pg_internal.init"];

/// Root-level directories kept as (empty) paths while their contents are
/// skipped. The cluster rebuilds all of them at startup.
const SKIP_CONTENT_DIRS: &[&str] = &[
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
];

/// Temporary-sort directories, skipped entirely at any depth.
const SKIP_TEMP_DIR: &str = "pgsql_tmp";

/// A tablespace reported by the cluster, used to name link targets.
#[derive(Debug, Clone)]
pub struct TablespaceInfo {
    pub oid: u32,
    pub name: String,
}

/// Options controlling the walk.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Copy WAL segments into the backup rather than skipping WAL contents.
    pub archive_copy: bool,
    /// Additional manifest-relative names (under `pg_data/`) to exclude.
    pub exclusions: Vec<String>,
    /// Ownership recorded for every entry.
    pub user: Owner,
    pub group: Owner,
}

/// Walk the data directory and every tablespace, populating the manifest's
/// targets, paths, files, and links.
pub fn build(
    manifest: &mut Manifest,
    data_path: &Path,
    version: PgVersion,
    catalog_version: u32,
    tablespaces: &[TablespaceInfo],
    options: &BuildOptions,
) -> Result<()> {
    manifest.defaults = Defaults {
        user: options.user.clone(),
        group: options.group.clone(),
        ..Defaults::default()
    };
    let defaults = manifest.defaults.clone();

    manifest.add_target(Target {
        name: TARGET_PG_DATA.into(),
        target_type: TargetType::Path,
        path: data_path.to_string_lossy().into_owned(),
        tablespace_id: None,
        tablespace_name: None,
        extra: Default::default(),
    })?;

    let root_meta = fs::metadata(data_path)
        .map_err(|_| Error::FileMissing(data_path.to_string_lossy().into_owned()))?;
    manifest.add_path(path_entry(TARGET_PG_DATA.into(), &root_meta, &defaults))?;

    let wal_dir = wal_dir(version);

    walk_tree(manifest, data_path, TARGET_PG_DATA, &defaults, &|rel: &str| {
        // User exclusions apply to the data directory only.
        if options
            .exclusions
            .iter()
            .any(|excl| rel == excl.as_str() || rel.starts_with(&format!("{excl}/")))
        {
            return Skip::Entirely;
        }

        let (first, rest) = rel.split_once('/').map_or((rel, None), |(f, r)| (f, Some(r)));

        if rest.is_some() && first == wal_dir && !options.archive_copy {
            return Skip::Entirely;
        }

        if rest.is_some() && SKIP_CONTENT_DIRS.contains(&first) {
            return Skip::Entirely;
        }

        Skip::No
    })?;

    // Each tablespace is its own target, reached through its pg_tblspc link.
    for entry in fs::read_dir(data_path.join("pg_tblspc"))
        .into_iter()
        .flatten()
        .flatten()
    {
        let oid_name = entry.file_name().to_string_lossy().into_owned();
        let Ok(oid) = oid_name.parse::<u32>() else {
            continue;
        };

        let link_path = entry.path();
        let destination = fs::read_link(&link_path).map_err(|_| {
            Error::Format(format!("'pg_tblspc/{oid_name}' is not a symbolic link"))
        })?;

        let target_name = format!("pg_tblspc/{oid}");
        let tablespace_name = tablespaces
            .iter()
            .find(|ts| ts.oid == oid)
            .map(|ts| ts.name.clone())
            .unwrap_or_else(|| format!("ts{oid}"));

        manifest.add_link(LinkEntry {
            name: format!("pg_data/pg_tblspc/{oid}"),
            destination: destination.to_string_lossy().into_owned(),
            user: defaults.user.clone(),
            group: defaults.group.clone(),
            extra: Default::default(),
        })?;

        manifest.add_target(Target {
            name: target_name.clone(),
            target_type: TargetType::Link,
            path: destination.to_string_lossy().into_owned(),
            tablespace_id: Some(oid),
            tablespace_name: Some(tablespace_name),
            extra: Default::default(),
        })?;

        // From 9.0 tablespace content lives under a per-version directory.
        let (walk_root, walk_prefix) = if version >= PG_VERSION_90 {
            let version_dir = tablespace_version_dir(version, catalog_version);
            (destination.join(&version_dir), format!("{target_name}/{version_dir}"))
        } else {
            (destination.clone(), target_name.clone())
        };

        if !walk_root.exists() {
            debug!(tablespace = oid, "tablespace has no content for this version yet");
            continue;
        }

        let meta = fs::metadata(&walk_root)?;
        manifest.add_path(path_entry(walk_prefix.clone(), &meta, &defaults))?;
        walk_tree(manifest, &walk_root, &walk_prefix, &defaults, &|_| Skip::No)?;
    }

    Ok(())
}

enum Skip {
    No,
    Entirely,
}

fn path_entry(name: String, meta: &fs::Metadata, defaults: &Defaults) -> PathEntry {
    PathEntry {
        name,
        mode: meta.mode() & 0o7777,
        user: defaults.user.clone(),
        group: defaults.group.clone(),
        extra: Default::default(),
    }
}

/// Files that must be read from the primary during a standby backup. The
/// relation data itself replays identically on the standby; everything else
/// may differ between the hosts.
fn is_master_only(name: &str) -> bool {
    !pgvault_postgres::is_relation_file(name)
}

fn walk_tree(
    manifest: &mut Manifest,
    root: &Path,
    name_prefix: &str,
    defaults: &Defaults,
    skip: &dyn Fn(&str) -> Skip,
) -> Result<()> {
    for entry in WalkDir::new(root).min_depth(1).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            Error::Storage(format!("unable to walk '{}': {err}", root.display()))
        })?;

        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::Assert("walk entry escaped its root".into()))?
            .to_string_lossy()
            .into_owned();

        if entry.path_is_symlink() && rel.starts_with("pg_tblspc/") {
            continue; // handled per-tablespace by the caller
        }

        if matches!(skip(&rel), Skip::Entirely) {
            continue;
        }

        if rel.split('/').any(|component| component == SKIP_TEMP_DIR) {
            continue;
        }

        let name = format!("{name_prefix}/{rel}");
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let destination = fs::read_link(entry.path())?;
            manifest.add_link(LinkEntry {
                name,
                destination: destination.to_string_lossy().into_owned(),
                user: defaults.user.clone(),
                group: defaults.group.clone(),
                extra: Default::default(),
            })?;
        } else if file_type.is_dir() {
            let meta = entry.metadata().map_err(|err| {
                Error::Storage(format!("unable to stat '{name}': {err}"))
            })?;
            manifest.add_path(path_entry(name, &meta, defaults))?;
        } else if file_type.is_file() {
            if SKIP_FILES.contains(&entry.file_name().to_string_lossy().as_ref()) {
                continue;
            }

            let meta = entry.metadata().map_err(|err| {
                Error::Storage(format!("unable to stat '{name}': {err}"))
            })?;

            let mut file = FileEntry::new(name, meta.len(), meta.mtime(), defaults);
            file.mode = meta.mode() & 0o7777;
            file.master = is_master_only(&file.name);
            manifest.add_file(file)?;
        } else {
            // Sockets and other special files cannot be restored.
            warn!(name = %name, "skipping special file");
        }
    }

    Ok(())
}
