//! `pg_control` reading.
//!
//! The control file identifies the cluster: version, system identifier,
//! catalog version, last checkpoint, page size, WAL segment size, and whether
//! page checksums are enabled. The version is determined by matching the
//! control-version / catalog-version pair against a vendored table, one entry
//! per supported major release.

use crate::version::{self, PgVersion};
use crate::wal::WAL_SEGMENT_SIZE_DEFAULT;
use pgvault_common::{Error, Result};

/// Minimum bytes that must be present to parse the control data. The file
/// itself is written as a full 8 KiB sector but only the header matters.
pub const CONTROL_DATA_SIZE: usize = 512;

/// Field offsets within the vendored control interface. The same layout is
/// used by [`PgControl::to_bytes`], which test fixtures use to fabricate
/// clusters, so reader and writer can never drift apart.
const OFFSET_SYSTEM_ID: usize = 0;
const OFFSET_CONTROL_VERSION: usize = 8;
const OFFSET_CATALOG_VERSION: usize = 12;
const OFFSET_CHECKPOINT: usize = 16;
const OFFSET_PAGE_SIZE: usize = 24;
const OFFSET_WAL_SEGMENT_SIZE: usize = 28;
const OFFSET_DATA_CHECKSUM_VERSION: usize = 32;

/// One supported major release: the control/catalog pair that identifies it.
struct ControlVersion {
    version: PgVersion,
    control_version: u32,
    catalog_version: u32,
}

/// Identification table, newest first. Where two majors share a control
/// version (9.0/9.1, 9.4/9.5) the catalog version disambiguates.
const CONTROL_VERSIONS: &[ControlVersion] = &[
    ControlVersion { version: version::PG_VERSION_13, control_version: 1300, catalog_version: 202007201 },
    ControlVersion { version: version::PG_VERSION_12, control_version: 1201, catalog_version: 201909212 },
    ControlVersion { version: version::PG_VERSION_11, control_version: 1100, catalog_version: 201809051 },
    ControlVersion { version: version::PG_VERSION_10, control_version: 1002, catalog_version: 201707211 },
    ControlVersion { version: version::PG_VERSION_96, control_version: 960, catalog_version: 201608131 },
    ControlVersion { version: version::PG_VERSION_95, control_version: 942, catalog_version: 201510051 },
    ControlVersion { version: version::PG_VERSION_94, control_version: 942, catalog_version: 201409291 },
    ControlVersion { version: version::PG_VERSION_93, control_version: 937, catalog_version: 201306121 },
    ControlVersion { version: version::PG_VERSION_92, control_version: 922, catalog_version: 201204301 },
    ControlVersion { version: version::PG_VERSION_91, control_version: 903, catalog_version: 201105231 },
    ControlVersion { version: version::PG_VERSION_90, control_version: 903, catalog_version: 201008051 },
    ControlVersion { version: version::PG_VERSION_84, control_version: 843, catalog_version: 200904091 },
];

/// Parsed cluster control data. Immutable for the duration of one backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgControl {
    pub version: PgVersion,
    pub system_id: u64,
    pub catalog_version: u32,
    pub checkpoint: u64,
    pub page_size: u32,
    pub wal_segment_size: u32,
    pub page_checksum: bool,
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

impl PgControl {
    /// Parse control data read from `global/pg_control`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CONTROL_DATA_SIZE {
            return Err(Error::Format(format!(
                "pg_control is only {} bytes, expected at least {CONTROL_DATA_SIZE}",
                data.len()
            )));
        }

        let control_version = read_u32(data, OFFSET_CONTROL_VERSION);
        let catalog_version = read_u32(data, OFFSET_CATALOG_VERSION);

        let entry = CONTROL_VERSIONS
            .iter()
            .find(|entry| {
                entry.control_version == control_version
                    && entry.catalog_version == catalog_version
            })
            .ok_or_else(|| {
                Error::Format(format!(
                    "unexpected control version = {control_version}, catalog version = \
                     {catalog_version}\nHINT: is this version of PostgreSQL supported?"
                ))
            })?;

        // Data checksums appeared in 9.3. Earlier control data does not
        // carry the field at all.
        let page_checksum = entry.version >= version::PG_VERSION_PAGE_CHECKSUM
            && read_u32(data, OFFSET_DATA_CHECKSUM_VERSION) != 0;

        Ok(PgControl {
            version: entry.version,
            system_id: read_u64(data, OFFSET_SYSTEM_ID),
            catalog_version,
            checkpoint: read_u64(data, OFFSET_CHECKPOINT),
            page_size: read_u32(data, OFFSET_PAGE_SIZE),
            wal_segment_size: read_u32(data, OFFSET_WAL_SEGMENT_SIZE),
            page_checksum,
        })
    }

    /// Catalog version recorded for a major release.
    pub fn catalog_version_for(version: PgVersion) -> Result<u32> {
        CONTROL_VERSIONS
            .iter()
            .find(|entry| entry.version == version)
            .map(|entry| entry.catalog_version)
            .ok_or_else(|| {
                Error::Assert(format!(
                    "no catalog version for PostgreSQL {}",
                    version::version_to_str(version)
                ))
            })
    }

    /// Serialize control data in the vendored layout. Fixtures use this to
    /// fabricate `global/pg_control` for test clusters.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let entry = CONTROL_VERSIONS
            .iter()
            .find(|entry| entry.version == self.version)
            .ok_or_else(|| {
                Error::Assert(format!(
                    "cannot encode control data for unsupported version {}",
                    self.version
                ))
            })?;

        let mut data = vec![0u8; 8192];
        data[OFFSET_SYSTEM_ID..OFFSET_SYSTEM_ID + 8].copy_from_slice(&self.system_id.to_le_bytes());
        data[OFFSET_CONTROL_VERSION..OFFSET_CONTROL_VERSION + 4]
            .copy_from_slice(&entry.control_version.to_le_bytes());
        data[OFFSET_CATALOG_VERSION..OFFSET_CATALOG_VERSION + 4]
            .copy_from_slice(&entry.catalog_version.to_le_bytes());
        data[OFFSET_CHECKPOINT..OFFSET_CHECKPOINT + 8]
            .copy_from_slice(&self.checkpoint.to_le_bytes());
        data[OFFSET_PAGE_SIZE..OFFSET_PAGE_SIZE + 4]
            .copy_from_slice(&self.page_size.to_le_bytes());
        data[OFFSET_WAL_SEGMENT_SIZE..OFFSET_WAL_SEGMENT_SIZE + 4]
            .copy_from_slice(&self.wal_segment_size.to_le_bytes());

        if entry.version >= version::PG_VERSION_PAGE_CHECKSUM {
            let checksum_version: u32 = if self.page_checksum { 1 } else { 0 };
            data[OFFSET_DATA_CHECKSUM_VERSION..OFFSET_DATA_CHECKSUM_VERSION + 4]
                .copy_from_slice(&checksum_version.to_le_bytes());
        }

        Ok(data)
    }
}

impl Default for PgControl {
    fn default() -> Self {
        PgControl {
            version: version::PG_VERSION_MAX,
            system_id: 0,
            catalog_version: 0,
            checkpoint: 0,
            page_size: crate::page::PAGE_SIZE_DEFAULT as u32,
            wal_segment_size: WAL_SEGMENT_SIZE_DEFAULT,
            page_checksum: false,
        }
    }
}
