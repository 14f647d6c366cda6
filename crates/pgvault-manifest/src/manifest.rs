//! The backup manifest: the authoritative record of a backup's content.

use crate::entry::{Defaults, FileEntry, LinkEntry, Owner, PathEntry, Target, TargetType};
use crate::ini::{self, IniDoc};
use pgvault_common::{BackupType, CipherType, CompressionType, Error, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Primary manifest file name within a backup directory.
pub const MANIFEST_FILE: &str = "backup.manifest";
/// Verbatim copy kept for torn-write recovery.
pub const MANIFEST_COPY_FILE: &str = "backup.manifest.copy";

/// The implicit primary target.
pub const TARGET_PG_DATA: &str = "pg_data";

/// `[backup]` header section.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupSection {
    pub label: String,
    pub prior: Option<String>,
    pub backup_type: BackupType,
    pub timestamp_start: i64,
    pub timestamp_copy_start: i64,
    pub timestamp_stop: Option<i64>,
    pub lsn_start: Option<String>,
    pub lsn_stop: Option<String>,
    pub archive_start: Option<String>,
    pub archive_stop: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

/// `[backup:option]` header section: the settings this backup was taken
/// under. Resume compatibility is decided against these.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionSection {
    pub archive_check: bool,
    pub archive_copy: bool,
    pub backup_standby: bool,
    pub buffer_size: u64,
    pub checksum_page: bool,
    pub cipher_type: CipherType,
    pub compress_type: CompressionType,
    pub compress_level: u32,
    pub delta: bool,
    pub hardlink: bool,
    pub online: bool,
    pub process_max: u32,
    pub extra: BTreeMap<String, Value>,
}

impl Default for OptionSection {
    fn default() -> Self {
        OptionSection {
            archive_check: true,
            archive_copy: false,
            backup_standby: false,
            buffer_size: 1024 * 1024,
            checksum_page: false,
            cipher_type: CipherType::None,
            compress_type: CompressionType::None,
            compress_level: 6,
            delta: false,
            hardlink: false,
            online: true,
            process_max: 1,
            extra: BTreeMap::new(),
        }
    }
}

/// `[backup:db]` informational section: cluster identity.
#[derive(Debug, Clone, PartialEq)]
pub struct DbSection {
    /// Major version in PostgreSQL's own style, e.g. `"9.6"`.
    pub version: String,
    pub system_id: u64,
    pub catalog_version: u32,
    pub extra: BTreeMap<String, Value>,
}

/// In-memory manifest. Collections are kept sorted by name so lookups are
/// logarithmic and serialization order is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub backup: BackupSection,
    pub options: OptionSection,
    pub db: DbSection,
    pub defaults: Defaults,
    targets: Vec<Target>,
    paths: Vec<PathEntry>,
    files: Vec<FileEntry>,
    links: Vec<LinkEntry>,
    /// Whole sections this version does not recognize, preserved verbatim.
    unknown: BTreeMap<String, BTreeMap<String, Value>>,
}

fn insert_sorted<T>(list: &mut Vec<T>, item: T, name: impl Fn(&T) -> &str) -> Result<()> {
    match list.binary_search_by(|probe| name(probe).cmp(name(&item))) {
        Ok(_) => Err(Error::Assert(format!("'{}' is already in the manifest", name(&item)))),
        Err(pos) => {
            list.insert(pos, item);
            Ok(())
        }
    }
}

fn find_sorted<'a, T>(list: &'a [T], target: &str, name: impl Fn(&T) -> &str) -> Option<&'a T> {
    list.binary_search_by(|probe| name(probe).cmp(target))
        .ok()
        .map(|pos| &list[pos])
}

impl Manifest {
    pub fn new(backup: BackupSection, options: OptionSection, db: DbSection) -> Self {
        Manifest {
            backup,
            options,
            db,
            defaults: Defaults::default(),
            targets: Vec::new(),
            paths: Vec::new(),
            files: Vec::new(),
            links: Vec::new(),
            unknown: BTreeMap::new(),
        }
    }

    pub fn add_target(&mut self, target: Target) -> Result<()> {
        insert_sorted(&mut self.targets, target, |t| &t.name)
    }

    pub fn add_path(&mut self, path: PathEntry) -> Result<()> {
        insert_sorted(&mut self.paths, path, |p| &p.name)
    }

    pub fn add_file(&mut self, file: FileEntry) -> Result<()> {
        insert_sorted(&mut self.files, file, |f| &f.name)
    }

    pub fn add_link(&mut self, link: LinkEntry) -> Result<()> {
        insert_sorted(&mut self.links, link, |l| &l.name)
    }

    pub fn target_list(&self) -> &[Target] {
        &self.targets
    }

    pub fn path_list(&self) -> &[PathEntry] {
        &self.paths
    }

    pub fn file_list(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn link_list(&self) -> &[LinkEntry] {
        &self.links
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        find_sorted(&self.targets, name, |t| &t.name)
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.files.binary_search_by(|probe| probe.name.as_str().cmp(name)).is_ok()
    }

    /// Look up a file entry. A missing name is an internal error: callers
    /// only ask for files the manifest told them about.
    pub fn file(&self, name: &str) -> Result<&FileEntry> {
        find_sorted(&self.files, name, |f| &f.name)
            .ok_or_else(|| Error::Assert(format!("unable to find '{name}' in manifest file list")))
    }

    pub fn file_mut(&mut self, name: &str) -> Result<&mut FileEntry> {
        match self.files.binary_search_by(|probe| probe.name.as_str().cmp(name)) {
            Ok(pos) => Ok(&mut self.files[pos]),
            Err(_) => Err(Error::Assert(format!("unable to find '{name}' in manifest file list"))),
        }
    }

    /// Drop a file, e.g. when the source disappeared mid-backup.
    pub fn remove_file(&mut self, name: &str) {
        if let Ok(pos) = self.files.binary_search_by(|probe| probe.name.as_str().cmp(name)) {
            self.files.remove(pos);
        }
    }

    /// Record that a file's bytes live in a prior backup. The file then
    /// contributes nothing to this backup's repository size.
    pub fn set_reference(&mut self, name: &str, prior: &str) -> Result<()> {
        let file = self.file_mut(name)?;
        file.reference = Some(prior.to_string());
        file.repo_size = Some(0);
        Ok(())
    }

    /// Total size of the cluster content this manifest covers.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Bytes stored in this backup's own repository directory.
    pub fn repo_total_size(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| f.reference.is_none())
            .map(|f| f.repo_size.unwrap_or(f.size))
            .sum()
    }

    /// Labels of all prior backups referenced by any file.
    pub fn reference_list(&self) -> Vec<&str> {
        let mut list: Vec<&str> =
            self.files.iter().filter_map(|f| f.reference.as_deref()).collect();
        list.sort_unstable();
        list.dedup();
        list
    }

    fn path_or_target_exists(&self, name: &str) -> bool {
        find_sorted(&self.paths, name, |p| &p.name).is_some() || self.target(name).is_some()
    }

    /// Structural invariants checked before every save.
    pub fn validate(&self) -> Result<()> {
        let data_targets =
            self.targets.iter().filter(|t| t.name == TARGET_PG_DATA).count();
        if data_targets != 1 {
            return Err(Error::Assert(format!(
                "expected exactly one '{TARGET_PG_DATA}' target, found {data_targets}"
            )));
        }

        for target in &self.targets {
            if let Some(id) = target.tablespace_id {
                if target.name != format!("pg_tblspc/{id}") {
                    return Err(Error::Assert(format!(
                        "tablespace target '{}' does not match its id {id}",
                        target.name
                    )));
                }
            }
        }

        for file in &self.files {
            let parent = file.name.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            if !self.path_or_target_exists(parent) {
                return Err(Error::Assert(format!(
                    "file '{}' has no containing path in the manifest",
                    file.name
                )));
            }

            if self.backup.backup_type == BackupType::Full && file.reference.is_some() {
                return Err(Error::Assert(format!(
                    "full backup cannot reference a prior backup for '{}'",
                    file.name
                )));
            }
        }

        for link in &self.links {
            let parent = link.name.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            if !self.path_or_target_exists(parent) {
                return Err(Error::Assert(format!(
                    "link '{}' has no containing path in the manifest",
                    link.name
                )));
            }
        }

        Ok(())
    }

    fn compute_defaults(&self) -> Defaults {
        fn most_common<T: Ord + Clone>(values: impl Iterator<Item = T>, fallback: T) -> T {
            let mut counts: BTreeMap<T, usize> = BTreeMap::new();
            for value in values {
                *counts.entry(value).or_default() += 1;
            }
            counts
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(value, _)| value)
                .unwrap_or(fallback)
        }

        let base = Defaults::default();

        Defaults {
            file_master: most_common(self.files.iter().map(|f| f.master), base.file_master),
            file_mode: most_common(self.files.iter().map(|f| f.mode), base.file_mode),
            path_mode: most_common(self.paths.iter().map(|p| p.mode), base.path_mode),
            user: most_common(
                self.files
                    .iter()
                    .map(|f| f.user.clone())
                    .chain(self.paths.iter().map(|p| p.user.clone()))
                    .chain(self.links.iter().map(|l| l.user.clone())),
                base.user,
            ),
            group: most_common(
                self.files
                    .iter()
                    .map(|f| f.group.clone())
                    .chain(self.paths.iter().map(|p| p.group.clone()))
                    .chain(self.links.iter().map(|l| l.group.clone())),
                base.group,
            ),
        }
    }

    fn owner_value(owner: &Owner) -> Value {
        match owner {
            Some(name) => Value::String(name.clone()),
            None => Value::Bool(false),
        }
    }

    fn owner_from(value: &Value) -> Result<Owner> {
        match value {
            Value::String(name) => Ok(Some(name.clone())),
            Value::Bool(false) => Ok(None),
            other => Err(Error::Format(format!("invalid owner value '{other}'"))),
        }
    }

    /// Serialize to manifest text, including the integrity checksum.
    pub fn to_text(&self) -> Result<String> {
        self.validate()?;

        let defaults = self.compute_defaults();
        let mut doc = IniDoc::new();

        // [backup]
        doc.set("backup", "backup-label", Value::String(self.backup.label.clone()));
        if let Some(prior) = &self.backup.prior {
            doc.set("backup", "backup-prior", Value::String(prior.clone()));
        }
        doc.set("backup", "backup-timestamp-start", Value::from(self.backup.timestamp_start));
        doc.set(
            "backup",
            "backup-timestamp-copy-start",
            Value::from(self.backup.timestamp_copy_start),
        );
        if let Some(stop) = self.backup.timestamp_stop {
            doc.set("backup", "backup-timestamp-stop", Value::from(stop));
        }
        doc.set("backup", "backup-type", Value::String(self.backup.backup_type.to_string()));
        if let Some(lsn) = &self.backup.lsn_start {
            doc.set("backup", "backup-lsn-start", Value::String(lsn.clone()));
        }
        if let Some(lsn) = &self.backup.lsn_stop {
            doc.set("backup", "backup-lsn-stop", Value::String(lsn.clone()));
        }
        if let Some(archive) = &self.backup.archive_start {
            doc.set("backup", "backup-archive-start", Value::String(archive.clone()));
        }
        if let Some(archive) = &self.backup.archive_stop {
            doc.set("backup", "backup-archive-stop", Value::String(archive.clone()));
        }
        for (key, value) in &self.backup.extra {
            doc.set("backup", key, value.clone());
        }

        // [backup:db]
        doc.set("backup:db", "db-version", Value::String(self.db.version.clone()));
        doc.set("backup:db", "db-system-id", Value::from(self.db.system_id));
        doc.set("backup:db", "db-catalog-version", Value::from(self.db.catalog_version));
        for (key, value) in &self.db.extra {
            doc.set("backup:db", key, value.clone());
        }

        // [backup:option]
        let opt = &self.options;
        doc.set("backup:option", "option-archive-check", Value::Bool(opt.archive_check));
        doc.set("backup:option", "option-archive-copy", Value::Bool(opt.archive_copy));
        doc.set("backup:option", "option-backup-standby", Value::Bool(opt.backup_standby));
        doc.set("backup:option", "option-buffer-size", Value::from(opt.buffer_size));
        doc.set("backup:option", "option-checksum-page", Value::Bool(opt.checksum_page));
        doc.set(
            "backup:option",
            "option-cipher-type",
            Value::String(opt.cipher_type.to_string()),
        );
        doc.set(
            "backup:option",
            "option-compress-type",
            Value::String(opt.compress_type.to_string()),
        );
        doc.set("backup:option", "option-compress-level", Value::from(opt.compress_level));
        doc.set("backup:option", "option-delta", Value::Bool(opt.delta));
        doc.set("backup:option", "option-hardlink", Value::Bool(opt.hardlink));
        doc.set("backup:option", "option-online", Value::Bool(opt.online));
        doc.set("backup:option", "option-process-max", Value::from(opt.process_max));
        for (key, value) in &opt.extra {
            doc.set("backup:option", key, value.clone());
        }

        // [backup:target]
        for target in &self.targets {
            doc.set("backup:target", &target.name, target.to_value());
        }

        // Entry sections with their defaults.
        if !self.files.is_empty() {
            doc.set("target:file:default", "master", Value::Bool(defaults.file_master));
            doc.set(
                "target:file:default",
                "mode",
                Value::String(format!("{:04o}", defaults.file_mode)),
            );
            doc.set("target:file:default", "user", Self::owner_value(&defaults.user));
            doc.set("target:file:default", "group", Self::owner_value(&defaults.group));

            for file in &self.files {
                doc.set("target:file", &file.name, file.to_value(&defaults));
            }
        }

        if !self.paths.is_empty() {
            doc.set(
                "target:path:default",
                "mode",
                Value::String(format!("{:04o}", defaults.path_mode)),
            );
            doc.set("target:path:default", "user", Self::owner_value(&defaults.user));
            doc.set("target:path:default", "group", Self::owner_value(&defaults.group));

            for path in &self.paths {
                doc.set("target:path", &path.name, path.to_value(&defaults));
            }
        }

        if !self.links.is_empty() {
            doc.set("target:link:default", "user", Self::owner_value(&defaults.user));
            doc.set("target:link:default", "group", Self::owner_value(&defaults.group));

            for link in &self.links {
                doc.set("target:link", &link.name, link.to_value(&defaults));
            }
        }

        // Sections from a future format version, passed through untouched.
        for (section, keys) in &self.unknown {
            for (key, value) in keys {
                doc.set(section, key, value.clone());
            }
        }

        Ok(ini::to_text_with_checksum(&mut doc))
    }

    /// Parse manifest text, verifying the integrity checksum.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut doc = ini::from_text_checked(text)?;
        doc.take_section(ini::CHECKSUM_SECTION);

        let mut backup_keys = doc.take_section("backup");
        let take_str = |keys: &mut BTreeMap<String, Value>, key: &str| -> Result<Option<String>> {
            match keys.remove(key) {
                None => Ok(None),
                Some(Value::String(text)) => Ok(Some(text)),
                Some(other) => Err(Error::Format(format!("invalid value '{other}' for '{key}'"))),
            }
        };
        let take_i64 = |keys: &mut BTreeMap<String, Value>, key: &str| -> Result<Option<i64>> {
            match keys.remove(key) {
                None => Ok(None),
                Some(value) => value
                    .as_i64()
                    .map(Some)
                    .ok_or_else(|| Error::Format(format!("invalid value for '{key}'"))),
            }
        };
        let take_bool = |keys: &mut BTreeMap<String, Value>, key: &str| -> Result<Option<bool>> {
            match keys.remove(key) {
                None => Ok(None),
                Some(value) => value
                    .as_bool()
                    .map(Some)
                    .ok_or_else(|| Error::Format(format!("invalid value for '{key}'"))),
            }
        };

        let backup = BackupSection {
            label: take_str(&mut backup_keys, "backup-label")?
                .ok_or_else(|| Error::Format("manifest is missing backup-label".into()))?,
            prior: take_str(&mut backup_keys, "backup-prior")?,
            backup_type: BackupType::parse(
                &take_str(&mut backup_keys, "backup-type")?
                    .ok_or_else(|| Error::Format("manifest is missing backup-type".into()))?,
            )?,
            timestamp_start: take_i64(&mut backup_keys, "backup-timestamp-start")?
                .ok_or_else(|| Error::Format("manifest is missing backup-timestamp-start".into()))?,
            timestamp_copy_start: take_i64(&mut backup_keys, "backup-timestamp-copy-start")?
                .ok_or_else(|| {
                    Error::Format("manifest is missing backup-timestamp-copy-start".into())
                })?,
            timestamp_stop: take_i64(&mut backup_keys, "backup-timestamp-stop")?,
            lsn_start: take_str(&mut backup_keys, "backup-lsn-start")?,
            lsn_stop: take_str(&mut backup_keys, "backup-lsn-stop")?,
            archive_start: take_str(&mut backup_keys, "backup-archive-start")?,
            archive_stop: take_str(&mut backup_keys, "backup-archive-stop")?,
            extra: backup_keys,
        };

        let mut db_keys = doc.take_section("backup:db");
        let db = DbSection {
            version: take_str(&mut db_keys, "db-version")?
                .ok_or_else(|| Error::Format("manifest is missing db-version".into()))?,
            system_id: db_keys
                .remove("db-system-id")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::Format("manifest is missing db-system-id".into()))?,
            catalog_version: db_keys
                .remove("db-catalog-version")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::Format("manifest is missing db-catalog-version".into()))?
                as u32,
            extra: db_keys,
        };

        let mut option_keys = doc.take_section("backup:option");
        let option_defaults = OptionSection::default();
        let options = OptionSection {
            archive_check: take_bool(&mut option_keys, "option-archive-check")?
                .unwrap_or(option_defaults.archive_check),
            archive_copy: take_bool(&mut option_keys, "option-archive-copy")?
                .unwrap_or(option_defaults.archive_copy),
            backup_standby: take_bool(&mut option_keys, "option-backup-standby")?
                .unwrap_or(option_defaults.backup_standby),
            buffer_size: option_keys
                .remove("option-buffer-size")
                .and_then(|v| v.as_u64())
                .unwrap_or(option_defaults.buffer_size),
            checksum_page: take_bool(&mut option_keys, "option-checksum-page")?
                .unwrap_or(option_defaults.checksum_page),
            cipher_type: match take_str(&mut option_keys, "option-cipher-type")? {
                Some(text) => CipherType::parse(&text)?,
                None => option_defaults.cipher_type,
            },
            compress_type: match take_str(&mut option_keys, "option-compress-type")? {
                Some(text) => CompressionType::parse(&text)?,
                None => option_defaults.compress_type,
            },
            compress_level: option_keys
                .remove("option-compress-level")
                .and_then(|v| v.as_u64())
                .unwrap_or(option_defaults.compress_level as u64) as u32,
            delta: take_bool(&mut option_keys, "option-delta")?.unwrap_or(option_defaults.delta),
            hardlink: take_bool(&mut option_keys, "option-hardlink")?
                .unwrap_or(option_defaults.hardlink),
            online: take_bool(&mut option_keys, "option-online")?.unwrap_or(option_defaults.online),
            process_max: option_keys
                .remove("option-process-max")
                .and_then(|v| v.as_u64())
                .unwrap_or(option_defaults.process_max as u64) as u32,
            extra: option_keys,
        };

        let mut manifest = Manifest::new(backup, options, db);

        for (name, value) in doc.take_section("backup:target") {
            let target = Target::from_value(&name, &value)?;
            manifest.add_target(target)?;
        }

        // Defaults must be known before entries parse.
        let file_default_keys = doc.take_section("target:file:default");
        let path_default_keys = doc.take_section("target:path:default");
        let link_default_keys = doc.take_section("target:link:default");

        let base = Defaults::default();
        let defaults = Defaults {
            file_master: file_default_keys
                .get("master")
                .and_then(Value::as_bool)
                .unwrap_or(base.file_master),
            file_mode: file_default_keys
                .get("mode")
                .and_then(Value::as_str)
                .and_then(|m| u32::from_str_radix(m, 8).ok())
                .unwrap_or(base.file_mode),
            path_mode: path_default_keys
                .get("mode")
                .and_then(Value::as_str)
                .and_then(|m| u32::from_str_radix(m, 8).ok())
                .unwrap_or(base.path_mode),
            user: match file_default_keys
                .get("user")
                .or_else(|| path_default_keys.get("user"))
                .or_else(|| link_default_keys.get("user"))
            {
                Some(value) => Self::owner_from(value)?,
                None => base.user.clone(),
            },
            group: match file_default_keys
                .get("group")
                .or_else(|| path_default_keys.get("group"))
                .or_else(|| link_default_keys.get("group"))
            {
                Some(value) => Self::owner_from(value)?,
                None => base.group.clone(),
            },
        };

        for (name, value) in doc.take_section("target:file") {
            manifest.add_file(FileEntry::from_value(&name, &value, &defaults)?)?;
        }

        for (name, value) in doc.take_section("target:path") {
            manifest.add_path(PathEntry::from_value(&name, &value, &defaults)?)?;
        }

        for (name, value) in doc.take_section("target:link") {
            manifest.add_link(LinkEntry::from_value(&name, &value, &defaults)?)?;
        }

        manifest.defaults = defaults;
        manifest.unknown = doc.sections;
        manifest.validate()?;

        Ok(manifest)
    }

    /// Load from the primary text, falling back to the copy when the primary
    /// is missing or fails its integrity check.
    pub fn load_with_fallback(primary: Option<&str>, copy: Option<&str>) -> Result<Self> {
        let primary_err = match primary {
            Some(text) => match Self::from_text(text) {
                Ok(manifest) => return Ok(manifest),
                Err(err) => {
                    warn!("primary manifest unusable ({err}), trying copy");
                    Some(err)
                }
            },
            None => None,
        };

        match copy {
            Some(text) => Self::from_text(text).map_err(|copy_err| primary_err.unwrap_or(copy_err)),
            None => Err(primary_err
                .unwrap_or_else(|| Error::FileMissing(format!("{MANIFEST_FILE} (and copy)")))),
        }
    }
}

/// Build a lookup from file name to entry for cross-manifest comparison.
pub fn file_index(manifest: &Manifest) -> HashMap<&str, &FileEntry> {
    manifest.file_list().iter().map(|f| (f.name.as_str(), f)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_manifest() -> Manifest {
        let backup = BackupSection {
            label: "20191002-171031F".into(),
            prior: None,
            backup_type: BackupType::Full,
            timestamp_start: 1570036231,
            timestamp_copy_start: 1570036232,
            timestamp_stop: None,
            lsn_start: Some("0/28000028".into()),
            lsn_stop: None,
            archive_start: Some("000000010000000000000028".into()),
            archive_stop: None,
            extra: BTreeMap::new(),
        };

        let db = DbSection {
            version: "9.6".into(),
            system_id: 6569239123849665679,
            catalog_version: 201608131,
            extra: BTreeMap::new(),
        };

        let mut manifest = Manifest::new(backup, OptionSection::default(), db);

        manifest
            .add_target(Target {
                name: TARGET_PG_DATA.into(),
                target_type: TargetType::Path,
                path: "/var/lib/pgsql/data".into(),
                tablespace_id: None,
                tablespace_name: None,
                extra: BTreeMap::new(),
            })
            .unwrap();

        let defaults = Defaults::default();
        manifest
            .add_path(PathEntry {
                name: TARGET_PG_DATA.into(),
                mode: 0o750,
                user: defaults.user.clone(),
                group: defaults.group.clone(),
                extra: BTreeMap::new(),
            })
            .unwrap();
        manifest
            .add_path(PathEntry {
                name: "pg_data/global".into(),
                mode: 0o750,
                user: defaults.user.clone(),
                group: defaults.group.clone(),
                extra: BTreeMap::new(),
            })
            .unwrap();

        let mut version = FileEntry::new("pg_data/PG_VERSION", 3, 1570036000, &defaults);
        version.checksum = "0876acee6d1aa469e0a45bd2e9186b4e77bf2bd0".into();
        version.repo_size = Some(3);
        manifest.add_file(version).unwrap();

        let control = FileEntry::new("pg_data/global/pg_control", 8192, 1570036100, &defaults);
        manifest.add_file(control).unwrap();

        manifest
    }

    #[test]
    fn test_save_load_round_trip() {
        let manifest = sample_manifest();
        let text = manifest.to_text().unwrap();
        let loaded = Manifest::from_text(&text).unwrap();
        assert_eq!(loaded, manifest);

        // Save of the loaded manifest is byte-identical.
        assert_eq!(loaded.to_text().unwrap(), text);
    }

    #[test]
    fn test_unknown_sections_and_keys_survive() {
        let manifest = sample_manifest();
        let text = manifest.to_text().unwrap();

        // Simulate a newer writer: one unknown section, one unknown file key.
        let mut doc = ini::IniDoc::from_text(&text).unwrap();
        doc.set("future:section", "future-key", json!(17));
        let mut entry = doc.get("target:file", "pg_data/PG_VERSION").unwrap().clone();
        entry.as_object_mut().unwrap().insert("fancy".into(), json!("new"));
        doc.set("target:file", "pg_data/PG_VERSION", entry);
        let text = ini::to_text_with_checksum(&mut doc);

        let loaded = Manifest::from_text(&text).unwrap();
        let saved = loaded.to_text().unwrap();

        assert!(saved.contains("[future:section]"));
        assert!(saved.contains("future-key=17"));
        assert!(saved.contains("\"fancy\":\"new\""));
    }

    #[test]
    fn test_find_missing_is_assert() {
        let manifest = sample_manifest();
        let err = manifest.file("pg_data/nope").unwrap_err();
        assert!(matches!(err, Error::Assert(_)));
    }

    #[test]
    fn test_reference_zeroes_repo_size() {
        let mut manifest = sample_manifest();
        manifest.backup.backup_type = BackupType::Incremental;
        manifest.backup.prior = Some("20191001-171031F".into());

        manifest.set_reference("pg_data/PG_VERSION", "20191001-171031F").unwrap();

        let file = manifest.file("pg_data/PG_VERSION").unwrap();
        assert_eq!(file.repo_size, Some(0));
        assert_eq!(manifest.reference_list(), vec!["20191001-171031F"]);

        // Only pg_control contributes to this backup's repo size now.
        assert_eq!(manifest.repo_total_size(), 8192);
    }

    #[test]
    fn test_full_backup_rejects_references() {
        let mut manifest = sample_manifest();
        manifest.file_mut("pg_data/PG_VERSION").unwrap().reference =
            Some("20191001-171031F".into());

        let err = manifest.to_text().unwrap_err();
        assert!(matches!(err, Error::Assert(_)));
    }

    #[test]
    fn test_orphan_file_rejected() {
        let mut manifest = sample_manifest();
        let defaults = Defaults::default();
        manifest
            .add_file(FileEntry::new("pg_data/base/1/2", 0, 1570036000, &defaults))
            .unwrap();

        let err = manifest.to_text().unwrap_err();
        assert!(matches!(err, Error::Assert(_)));
    }

    #[test]
    fn test_missing_pg_data_target_rejected() {
        let sample = sample_manifest();
        let manifest =
            Manifest::new(sample.backup.clone(), OptionSection::default(), sample.db.clone());
        let err = manifest.to_text().unwrap_err();
        assert!(matches!(err, Error::Assert(_)));
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut manifest = sample_manifest();
        let defaults = Defaults::default();
        let err = manifest
            .add_file(FileEntry::new("pg_data/PG_VERSION", 3, 0, &defaults))
            .unwrap_err();
        assert!(matches!(err, Error::Assert(_)));
    }

    #[test]
    fn test_load_with_fallback() {
        let manifest = sample_manifest();
        let good = manifest.to_text().unwrap();
        let bad = good.replace("9.6", "6.9");

        // Corrupt primary falls back to copy.
        let loaded = Manifest::load_with_fallback(Some(&bad), Some(&good)).unwrap();
        assert_eq!(loaded, manifest);

        // Missing primary falls back to copy.
        let loaded = Manifest::load_with_fallback(None, Some(&good)).unwrap();
        assert_eq!(loaded, manifest);

        // Both bad: the primary's error wins.
        let err = Manifest::load_with_fallback(Some(&bad), Some(&bad)).unwrap_err();
        assert!(matches!(err, Error::Checksum(_)));

        // Nothing at all.
        let err = Manifest::load_with_fallback(None, None).unwrap_err();
        assert!(matches!(err, Error::FileMissing(_)));
    }

    #[test]
    fn test_file_list_sorted() {
        let manifest = sample_manifest();
        let names: Vec<&str> = manifest.file_list().iter().map(|f| f.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }
}
