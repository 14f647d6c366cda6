//! Manifest entry types and their JSON forms.
//!
//! Entries serialize as JSON objects on `name={...}` lines. Attributes equal
//! to the section default are omitted and restored on load; unrecognized
//! attributes are kept in an `extra` map so a load/save round trip never
//! drops them.

use pgvault_common::{Error, Result};
use pgvault_postgres::PageRange;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// File owner. `None` means ownership could not be mapped to a name and is
/// persisted as the JSON literal `false`.
pub type Owner = Option<String>;

fn owner_to_value(owner: &Owner) -> Value {
    match owner {
        Some(name) => Value::String(name.clone()),
        None => Value::Bool(false),
    }
}

fn owner_from_value(value: &Value) -> Result<Owner> {
    match value {
        Value::String(name) => Ok(Some(name.clone())),
        Value::Bool(false) => Ok(None),
        other => Err(Error::Format(format!("invalid owner value '{other}'"))),
    }
}

fn mode_to_value(mode: u32) -> Value {
    Value::String(format!("{mode:04o}"))
}

fn mode_from_value(value: &Value) -> Result<u32> {
    value
        .as_str()
        .and_then(|text| u32::from_str_radix(text, 8).ok())
        .ok_or_else(|| Error::Format(format!("invalid mode value '{value}'")))
}

/// Kind of backup target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Path,
    Link,
}

/// A top-level backup source: the data directory or one tablespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    pub target_type: TargetType,
    /// Absolute filesystem path of the target on the cluster host.
    pub path: String,
    pub tablespace_id: Option<u32>,
    pub tablespace_name: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl Target {
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("path".into(), Value::String(self.path.clone()));

        if let Some(id) = self.tablespace_id {
            map.insert("tablespace-id".into(), Value::String(id.to_string()));
        }

        if let Some(name) = &self.tablespace_name {
            map.insert("tablespace-name".into(), Value::String(name.clone()));
        }

        map.insert(
            "type".into(),
            Value::String(
                match self.target_type {
                    TargetType::Path => "path",
                    TargetType::Link => "link",
                }
                .into(),
            ),
        );

        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }

        Value::Object(map)
    }

    pub fn from_value(name: &str, value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::Format(format!("target '{name}' is not an object")))?;

        let mut target = Target {
            name: name.to_string(),
            target_type: TargetType::Path,
            path: String::new(),
            tablespace_id: None,
            tablespace_name: None,
            extra: BTreeMap::new(),
        };

        for (key, value) in map {
            match key.as_str() {
                "path" => {
                    target.path = value
                        .as_str()
                        .ok_or_else(|| Error::Format(format!("invalid path for target '{name}'")))?
                        .to_string();
                }
                "type" => {
                    target.target_type = match value.as_str() {
                        Some("path") => TargetType::Path,
                        Some("link") => TargetType::Link,
                        _ => {
                            return Err(Error::Format(format!(
                                "invalid type '{value}' for target '{name}'"
                            )))
                        }
                    };
                }
                "tablespace-id" => {
                    target.tablespace_id = Some(
                        value
                            .as_str()
                            .and_then(|id| id.parse().ok())
                            .ok_or_else(|| {
                                Error::Format(format!("invalid tablespace-id for target '{name}'"))
                            })?,
                    );
                }
                "tablespace-name" => {
                    target.tablespace_name = value.as_str().map(String::from);
                }
                _ => {
                    target.extra.insert(key.clone(), value.clone());
                }
            }
        }

        if target.path.is_empty() {
            return Err(Error::Format(format!("target '{name}' is missing its path")));
        }

        Ok(target)
    }
}

/// A directory inside a target.
#[derive(Debug, Clone, PartialEq)]
pub struct PathEntry {
    pub name: String,
    pub mode: u32,
    pub user: Owner,
    pub group: Owner,
    pub extra: BTreeMap<String, Value>,
}

/// A regular file inside a target.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub name: String,
    /// Size read from the source of truth.
    pub size: u64,
    /// Compressed/encrypted size in the repository, once copied.
    pub repo_size: Option<u64>,
    /// Modification time, seconds since the epoch.
    pub timestamp: i64,
    /// SHA-1 of the file content. Empty until the file has been copied.
    pub checksum: String,
    /// Label of the prior backup holding this file's bytes, when not copied
    /// into this backup.
    pub reference: Option<String>,
    /// Result of page-checksum verification, when performed.
    pub checksum_page: Option<bool>,
    pub checksum_page_error: Option<Vec<PageRange>>,
    /// File must be read from the primary, never a standby.
    pub master: bool,
    pub mode: u32,
    pub user: Owner,
    pub group: Owner,
    pub extra: BTreeMap<String, Value>,
}

/// A symbolic link inside a target.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEntry {
    pub name: String,
    pub destination: String,
    pub user: Owner,
    pub group: Owner,
    pub extra: BTreeMap<String, Value>,
}

/// Factored-out most-common attributes, one set per entry kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Defaults {
    pub file_master: bool,
    pub file_mode: u32,
    pub path_mode: u32,
    pub user: Owner,
    pub group: Owner,
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            file_master: true,
            file_mode: 0o640,
            path_mode: 0o750,
            user: None,
            group: None,
        }
    }
}

impl PathEntry {
    pub fn to_value(&self, defaults: &Defaults) -> Value {
        let mut map = Map::new();

        if self.mode != defaults.path_mode {
            map.insert("mode".into(), mode_to_value(self.mode));
        }
        if self.user != defaults.user {
            map.insert("user".into(), owner_to_value(&self.user));
        }
        if self.group != defaults.group {
            map.insert("group".into(), owner_to_value(&self.group));
        }

        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }

        Value::Object(map)
    }

    pub fn from_value(name: &str, value: &Value, defaults: &Defaults) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::Format(format!("path '{name}' is not an object")))?;

        let mut entry = PathEntry {
            name: name.to_string(),
            mode: defaults.path_mode,
            user: defaults.user.clone(),
            group: defaults.group.clone(),
            extra: BTreeMap::new(),
        };

        for (key, value) in map {
            match key.as_str() {
                "mode" => entry.mode = mode_from_value(value)?,
                "user" => entry.user = owner_from_value(value)?,
                "group" => entry.group = owner_from_value(value)?,
                _ => {
                    entry.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(entry)
    }
}

impl FileEntry {
    /// New entry with attribute defaults, as recorded during the cluster
    /// walk before any copy has happened.
    pub fn new(name: impl Into<String>, size: u64, timestamp: i64, defaults: &Defaults) -> Self {
        FileEntry {
            name: name.into(),
            size,
            repo_size: None,
            timestamp,
            checksum: String::new(),
            reference: None,
            checksum_page: None,
            checksum_page_error: None,
            master: defaults.file_master,
            mode: defaults.file_mode,
            user: defaults.user.clone(),
            group: defaults.group.clone(),
            extra: BTreeMap::new(),
        }
    }

    pub fn to_value(&self, defaults: &Defaults) -> Value {
        let mut map = Map::new();

        if !self.checksum.is_empty() {
            map.insert("checksum".into(), Value::String(self.checksum.clone()));
        }
        if let Some(valid) = self.checksum_page {
            map.insert("checksum-page".into(), Value::Bool(valid));
        }
        if let Some(error) = &self.checksum_page_error {
            if !error.is_empty() {
                map.insert(
                    "checksum-page-error".into(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
            }
        }
        if self.master != defaults.file_master {
            map.insert("master".into(), Value::Bool(self.master));
        }
        if self.mode != defaults.file_mode {
            map.insert("mode".into(), mode_to_value(self.mode));
        }
        if let Some(reference) = &self.reference {
            map.insert("reference".into(), Value::String(reference.clone()));
        }
        if let Some(repo_size) = self.repo_size {
            if repo_size != self.size {
                map.insert("repo-size".into(), Value::from(repo_size));
            }
        }
        map.insert("size".into(), Value::from(self.size));
        map.insert("timestamp".into(), Value::from(self.timestamp));
        if self.user != defaults.user {
            map.insert("user".into(), owner_to_value(&self.user));
        }
        if self.group != defaults.group {
            map.insert("group".into(), owner_to_value(&self.group));
        }

        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }

        Value::Object(map)
    }

    pub fn from_value(name: &str, value: &Value, defaults: &Defaults) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::Format(format!("file '{name}' is not an object")))?;

        let mut entry = FileEntry::new(name, 0, 0, defaults);
        let mut size_seen = false;

        for (key, value) in map {
            match key.as_str() {
                "checksum" => {
                    entry.checksum = value
                        .as_str()
                        .ok_or_else(|| Error::Format(format!("invalid checksum for '{name}'")))?
                        .to_string();
                }
                "checksum-page" => {
                    entry.checksum_page = Some(value.as_bool().ok_or_else(|| {
                        Error::Format(format!("invalid checksum-page for '{name}'"))
                    })?);
                }
                "checksum-page-error" => {
                    entry.checksum_page_error =
                        Some(serde_json::from_value(value.clone()).map_err(|_| {
                            Error::Format(format!("invalid checksum-page-error for '{name}'"))
                        })?);
                }
                "master" => {
                    entry.master = value
                        .as_bool()
                        .ok_or_else(|| Error::Format(format!("invalid master for '{name}'")))?;
                }
                "mode" => entry.mode = mode_from_value(value)?,
                "reference" => {
                    entry.reference = Some(
                        value
                            .as_str()
                            .ok_or_else(|| Error::Format(format!("invalid reference for '{name}'")))?
                            .to_string(),
                    );
                }
                "repo-size" => {
                    entry.repo_size = Some(value.as_u64().ok_or_else(|| {
                        Error::Format(format!("invalid repo-size for '{name}'"))
                    })?);
                }
                "size" => {
                    entry.size = value
                        .as_u64()
                        .ok_or_else(|| Error::Format(format!("invalid size for '{name}'")))?;
                    size_seen = true;
                }
                "timestamp" => {
                    entry.timestamp = value
                        .as_i64()
                        .ok_or_else(|| Error::Format(format!("invalid timestamp for '{name}'")))?;
                }
                "user" => entry.user = owner_from_value(value)?,
                "group" => entry.group = owner_from_value(value)?,
                _ => {
                    entry.extra.insert(key.clone(), value.clone());
                }
            }
        }

        if !size_seen {
            return Err(Error::Format(format!("file '{name}' is missing its size")));
        }

        // A file that was never copied has no repo size of its own.
        if entry.repo_size.is_none() && !entry.checksum.is_empty() {
            entry.repo_size = Some(entry.size);
        }

        Ok(entry)
    }
}

impl LinkEntry {
    pub fn to_value(&self, defaults: &Defaults) -> Value {
        let mut map = Map::new();
        map.insert("destination".into(), Value::String(self.destination.clone()));

        if self.user != defaults.user {
            map.insert("user".into(), owner_to_value(&self.user));
        }
        if self.group != defaults.group {
            map.insert("group".into(), owner_to_value(&self.group));
        }

        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }

        Value::Object(map)
    }

    pub fn from_value(name: &str, value: &Value, defaults: &Defaults) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::Format(format!("link '{name}' is not an object")))?;

        let mut entry = LinkEntry {
            name: name.to_string(),
            destination: String::new(),
            user: defaults.user.clone(),
            group: defaults.group.clone(),
            extra: BTreeMap::new(),
        };

        for (key, value) in map {
            match key.as_str() {
                "destination" => {
                    entry.destination = value
                        .as_str()
                        .ok_or_else(|| Error::Format(format!("invalid destination for '{name}'")))?
                        .to_string();
                }
                "user" => entry.user = owner_from_value(value)?,
                "group" => entry.group = owner_from_value(value)?,
                _ => {
                    entry.extra.insert(key.clone(), value.clone());
                }
            }
        }

        if entry.destination.is_empty() {
            return Err(Error::Format(format!("link '{name}' is missing its destination")));
        }

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> Defaults {
        Defaults {
            file_master: true,
            file_mode: 0o640,
            path_mode: 0o750,
            user: Some("postgres".into()),
            group: Some("postgres".into()),
        }
    }

    #[test]
    fn test_file_minimal_form_uses_defaults() {
        let defaults = defaults();
        let entry = FileEntry::new("pg_data/PG_VERSION", 3, 1570000000, &defaults);

        let value = entry.to_value(&defaults);
        assert_eq!(value, json!({"size": 3, "timestamp": 1570000000}));

        let back = FileEntry::from_value("pg_data/PG_VERSION", &value, &defaults).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_file_divergent_attributes_serialize() {
        let defaults = defaults();
        let mut entry = FileEntry::new("pg_data/global/pg_control", 8192, 1570000001, &defaults);
        entry.checksum = "4d7b5c6a".into();
        entry.repo_size = Some(120);
        entry.master = false;
        entry.mode = 0o600;
        entry.user = None;

        let value = entry.to_value(&defaults);
        let map = value.as_object().unwrap();
        assert_eq!(map["checksum"], json!("4d7b5c6a"));
        assert_eq!(map["repo-size"], json!(120));
        assert_eq!(map["master"], json!(false));
        assert_eq!(map["mode"], json!("0600"));
        assert_eq!(map["user"], json!(false));
        assert!(!map.contains_key("group"));

        let back = FileEntry::from_value("pg_data/global/pg_control", &value, &defaults).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_file_unknown_keys_preserved() {
        let defaults = defaults();
        let value = json!({"size": 10, "timestamp": 1, "future-flag": {"a": 1}});

        let entry = FileEntry::from_value("pg_data/f", &value, &defaults).unwrap();
        assert_eq!(entry.extra["future-flag"], json!({"a": 1}));
        assert_eq!(entry.to_value(&defaults), value);
    }

    #[test]
    fn test_file_missing_size_rejected() {
        let err =
            FileEntry::from_value("pg_data/f", &json!({"timestamp": 1}), &defaults()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_repo_size_defaults_to_size_when_copied() {
        let value = json!({"checksum": "ab", "size": 11, "timestamp": 1});
        let entry = FileEntry::from_value("pg_data/f", &value, &defaults()).unwrap();
        assert_eq!(entry.repo_size, Some(11));
    }

    #[test]
    fn test_target_round_trip() {
        let value = json!({
            "path": "/var/lib/pgsql/ts1",
            "tablespace-id": "16400",
            "tablespace-name": "ts1",
            "type": "link"
        });

        let target = Target::from_value("pg_tblspc/16400", &value).unwrap();
        assert_eq!(target.target_type, TargetType::Link);
        assert_eq!(target.tablespace_id, Some(16400));
        assert_eq!(target.to_value(), value);
    }

    #[test]
    fn test_link_round_trip() {
        let defaults = defaults();
        let value = json!({"destination": "/var/lib/pgsql/ts1"});
        let link = LinkEntry::from_value("pg_data/pg_tblspc/16400", &value, &defaults).unwrap();
        assert_eq!(link.destination, "/var/lib/pgsql/ts1");
        assert_eq!(link.to_value(&defaults), value);
    }

    #[test]
    fn test_path_round_trip() {
        let defaults = defaults();
        let mut entry = PathEntry {
            name: "pg_data/base".into(),
            mode: 0o700,
            user: defaults.user.clone(),
            group: defaults.group.clone(),
            extra: BTreeMap::new(),
        };

        let value = entry.to_value(&defaults);
        assert_eq!(value, json!({"mode": "0700"}));

        entry.mode = defaults.path_mode;
        assert_eq!(entry.to_value(&defaults), json!({}));
    }
}
