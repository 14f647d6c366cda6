//! WAL archive verification.
//!
//! An online backup is only consistent once every WAL segment written
//! between start and stop has reached the archive. The check polls the
//! repository archive until the segments appear or the archive timeout
//! expires.

use crate::layout::RepoLayout;
use pgvault_common::{Error, Result};
use pgvault_postgres::{wal_segment_range, Lsn};
use pgvault_storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// True when `segment` has been archived. Archived segments carry a
/// checksum suffix (and possibly a compression extension), so the match is
/// on the name prefix.
fn segment_archived(repo: &dyn Storage, layout: &RepoLayout, segment: &str) -> Result<bool> {
    let entries = repo.list(&layout.archive_segment_dir(segment))?;
    Ok(entries.iter().any(|info| info.name.starts_with(segment)))
}

/// Wait for every segment from `start` through `stop` to appear in the
/// archive. Returns the first and last segment names on success.
pub async fn wait_for_archive(
    repo: Arc<dyn Storage>,
    layout: &RepoLayout,
    timeline: u32,
    start: Lsn,
    stop: Lsn,
    segment_size: u32,
    timeout: Duration,
) -> Result<(String, String)> {
    let segments = wal_segment_range(timeline, start, stop, segment_size);
    let deadline = Instant::now() + timeout;

    info!(
        first = %segments[0],
        last = %segments[segments.len() - 1],
        total = segments.len(),
        "waiting for WAL segments to be archived"
    );

    for segment in &segments {
        loop {
            if segment_archived(repo.as_ref(), layout, segment)? {
                debug!(segment = %segment, "archived");
                break;
            }

            if Instant::now() >= deadline {
                return Err(Error::ArchiveTimeout { segment: segment.clone(), timeout });
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    Ok((segments[0].clone(), segments[segments.len() - 1].clone()))
}
