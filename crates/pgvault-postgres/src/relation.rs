//! Which manifest files are page-formatted relations.

/// Relations split into 1 GiB segment files.
pub const RELATION_SEGMENT_BYTES: u64 = 1024 * 1024 * 1024;

/// Directories (manifest-relative) whose regular files are relation data.
const RELATION_DIR_GLOBAL: &str = "pg_data/global";
const RELATION_DIR_BASE: &str = "pg_data/base";
const RELATION_DIR_TABLESPACE: &str = "pg_tblspc";

/// True when a manifest file name refers to a relation file whose pages can
/// carry checksums.
///
/// Relation files are named for their filenode: a leading digit covers the
/// main fork, segment suffixes (`12345.1`), and the fsm/vm forks
/// (`12345_fsm`), while excluding `PG_VERSION`, `pg_filenode.map`,
/// `pg_internal.init`, and other metadata that shares the directories.
pub fn is_relation_file(name: &str) -> bool {
    let Some((dir, file)) = name.rsplit_once('/') else {
        return false;
    };

    let in_relation_dir = dir == RELATION_DIR_GLOBAL
        || (dir.strip_prefix(RELATION_DIR_BASE).is_some_and(|db| {
            db.strip_prefix('/').is_some_and(|db| db.chars().all(|c| c.is_ascii_digit()))
        }))
        || (dir.starts_with(RELATION_DIR_TABLESPACE) && {
            // pg_tblspc/<oid>/PG_<ver>_<catalog>/<dboid>
            let mut parts = dir.split('/');
            parts.next(); // pg_tblspc
            matches!(
                (parts.next(), parts.next(), parts.next(), parts.next()),
                (Some(oid), Some(version_dir), Some(db), None)
                    if oid.chars().all(|c| c.is_ascii_digit())
                        && version_dir.starts_with("PG_")
                        && db.chars().all(|c| c.is_ascii_digit())
            )
        });

    in_relation_dir && file.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Block-number offset of a relation segment file within its relation.
/// `12345` is segment 0, `12345.1` starts 1 GiB worth of pages in, and so
/// on. Fork files have no segment suffix worth parsing and offset zero.
pub fn segment_page_offset(name: &str, page_size: u32) -> u32 {
    let segment_no = name
        .rsplit_once('.')
        .and_then(|(_, suffix)| suffix.parse::<u32>().ok())
        .unwrap_or(0);

    segment_no * (RELATION_SEGMENT_BYTES / page_size as u64) as u32
}
