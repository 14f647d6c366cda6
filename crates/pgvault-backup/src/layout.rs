//! Repository path layout.
//!
//! Everything under one stanza:
//!
//! ```text
//! <stanza>/backup/<label>/backup.manifest[.copy]
//! <stanza>/backup/<label>/pg_data/...
//! <stanza>/backup/<label>/pg_tblspc/<oid>/PG_<major>_<catalog>/...
//! <stanza>/backup/<label>.partial/        in-progress backup
//! <stanza>/backup/latest                  symlink to the newest label
//! <stanza>/archive/<seg16>/<segment>...   archived WAL
//! ```

use pgvault_common::label_type;
use pgvault_manifest::{MANIFEST_COPY_FILE, MANIFEST_FILE};

/// Suffix marking an in-progress backup directory.
pub const PARTIAL_SUFFIX: &str = ".partial";
/// Name of the published-latest symlink.
pub const LATEST_LINK: &str = "latest";

#[derive(Debug, Clone)]
pub struct RepoLayout {
    pub stanza: String,
}

impl RepoLayout {
    pub fn new(stanza: impl Into<String>) -> Self {
        RepoLayout { stanza: stanza.into() }
    }

    pub fn backup_root(&self) -> String {
        format!("{}/backup", self.stanza)
    }

    pub fn backup_dir(&self, label: &str) -> String {
        format!("{}/backup/{label}", self.stanza)
    }

    pub fn partial_dir(&self, label: &str) -> String {
        format!("{}/backup/{label}{PARTIAL_SUFFIX}", self.stanza)
    }

    pub fn manifest(&self, backup_dir: &str) -> String {
        format!("{backup_dir}/{MANIFEST_FILE}")
    }

    pub fn manifest_copy(&self, backup_dir: &str) -> String {
        format!("{backup_dir}/{MANIFEST_COPY_FILE}")
    }

    pub fn latest_link(&self) -> String {
        format!("{}/backup/{LATEST_LINK}", self.stanza)
    }

    pub fn archive_root(&self) -> String {
        format!("{}/archive", self.stanza)
    }

    /// Directory an archived WAL segment lands in: segments are fanned out
    /// by the first 16 characters of their name.
    pub fn archive_segment_dir(&self, segment: &str) -> String {
        format!("{}/archive/{}", self.stanza, &segment[..segment.len().min(16)])
    }

    /// True when a directory entry name under `backup/` is a backup label
    /// (published, not partial, not the latest link).
    pub fn is_backup_label(name: &str) -> bool {
        !name.ends_with(PARTIAL_SUFFIX) && name != LATEST_LINK && label_type(name).is_ok()
    }

    /// Label of a partial directory name, if it is one.
    pub fn partial_label(name: &str) -> Option<&str> {
        let label = name.strip_suffix(PARTIAL_SUFFIX)?;
        label_type(label).ok().map(|_| label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = RepoLayout::new("demo");
        assert_eq!(layout.backup_dir("20191002-171031F"), "demo/backup/20191002-171031F");
        assert_eq!(
            layout.partial_dir("20191002-171031F"),
            "demo/backup/20191002-171031F.partial"
        );
        assert_eq!(layout.latest_link(), "demo/backup/latest");
        assert_eq!(
            layout.manifest(&layout.backup_dir("20191002-171031F")),
            "demo/backup/20191002-171031F/backup.manifest"
        );
        assert_eq!(
            layout.archive_segment_dir("000000010000000000000028"),
            "demo/archive/0000000100000000"
        );
    }

    #[test]
    fn test_label_recognition() {
        assert!(RepoLayout::is_backup_label("20191002-171031F"));
        assert!(RepoLayout::is_backup_label("20191002-171031F_20191003-171031I"));
        assert!(!RepoLayout::is_backup_label("20191002-171031F.partial"));
        assert!(!RepoLayout::is_backup_label("latest"));
        assert!(!RepoLayout::is_backup_label("junk"));

        assert_eq!(
            RepoLayout::partial_label("20191002-171031F.partial"),
            Some("20191002-171031F")
        );
        assert_eq!(RepoLayout::partial_label("20191002-171031F"), None);
    }
}
