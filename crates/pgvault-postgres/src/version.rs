//! PostgreSQL major version identifiers.
//!
//! Versions are carried as the integer PostgreSQL itself reports from
//! `server_version_num`: `90605` for 9.6.5, `110002` for 11.2. Only the major
//! part matters to the backup engine, so constants here are the `.0` release
//! of each major.

use pgvault_common::{Error, Result};
use std::fmt;

/// A PostgreSQL version in `server_version_num` form, truncated to the major
/// release.
pub type PgVersion = u32;

pub const PG_VERSION_84: PgVersion = 80400;
pub const PG_VERSION_90: PgVersion = 90000;
pub const PG_VERSION_91: PgVersion = 90100;
pub const PG_VERSION_92: PgVersion = 90200;
pub const PG_VERSION_93: PgVersion = 90300;
pub const PG_VERSION_94: PgVersion = 90400;
pub const PG_VERSION_95: PgVersion = 90500;
pub const PG_VERSION_96: PgVersion = 90600;
pub const PG_VERSION_10: PgVersion = 100000;
pub const PG_VERSION_11: PgVersion = 110000;
pub const PG_VERSION_12: PgVersion = 120000;
pub const PG_VERSION_13: PgVersion = 130000;

/// Oldest and newest majors the engine understands.
pub const PG_VERSION_MIN: PgVersion = PG_VERSION_84;
pub const PG_VERSION_MAX: PgVersion = PG_VERSION_13;

/// First version with non-exclusive start/stop backup.
pub const PG_VERSION_BACKUP_NON_EXCLUSIVE: PgVersion = PG_VERSION_96;
/// First version that can take a backup from a standby.
pub const PG_VERSION_BACKUP_STANDBY: PgVersion = PG_VERSION_92;
/// First version supporting the fast-checkpoint flag on start backup.
pub const PG_VERSION_START_FAST: PgVersion = PG_VERSION_84;
/// First version with data page checksums.
pub const PG_VERSION_PAGE_CHECKSUM: PgVersion = PG_VERSION_93;
/// First version naming the WAL directory `pg_wal` rather than `pg_xlog`.
pub const PG_VERSION_WAL_DIR: PgVersion = PG_VERSION_10;

/// Truncate a `server_version_num` value to its major release.
pub fn version_major(version_num: u32) -> PgVersion {
    if version_num >= PG_VERSION_10 {
        (version_num / 10000) * 10000
    } else {
        (version_num / 100) * 100
    }
}

/// Parse a version string as reported by the user or stanza config,
/// e.g. `"9.6"` or `"11"`.
pub fn version_from_str(text: &str) -> Result<PgVersion> {
    let parts: Vec<&str> = text.split('.').collect();

    let version = match parts.as_slice() {
        [major] => major
            .parse::<u32>()
            .ok()
            .filter(|major| *major >= 10)
            .map(|major| major * 10000),
        [major, minor] => match (major.parse::<u32>(), minor.parse::<u32>()) {
            (Ok(major), Ok(minor)) if major < 10 && minor < 100 => {
                Some(major * 10000 + minor * 100)
            }
            _ => None,
        },
        _ => None,
    };

    version.ok_or_else(|| Error::Format(format!("'{text}' is not a valid PostgreSQL version")))
}

/// Render a major version the way PostgreSQL writes it, e.g. `9.6` or `11`.
pub fn version_to_str(version: PgVersion) -> String {
    if version >= PG_VERSION_10 {
        format!("{}", version / 10000)
    } else {
        format!("{}.{}", version / 10000, version % 10000 / 100)
    }
}

/// Name of the per-version directory inside a tablespace,
/// e.g. `PG_11_201809051`.
pub fn tablespace_version_dir(version: PgVersion, catalog_version: u32) -> String {
    format!("PG_{}_{catalog_version}", version_to_str(version))
}

/// Name of the WAL directory for a version (`pg_xlog` before 10).
pub fn wal_dir(version: PgVersion) -> &'static str {
    if version >= PG_VERSION_WAL_DIR {
        "pg_wal"
    } else {
        "pg_xlog"
    }
}

/// Wrapper giving `PgVersion` a `Display` in PostgreSQL's own style.
pub struct VersionDisplay(pub PgVersion);

impl fmt::Display for VersionDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&version_to_str(self.0))
    }
}
