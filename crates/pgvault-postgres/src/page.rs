//! Data page checksums.
//!
//! PostgreSQL's page checksum is an FNV-1a derivative computed over 32
//! parallel sums with the block number mixed in, reduced to 16 bits and
//! stored in the page header. [`checksum_page`] reproduces it;
//! [`PageVerifier`] applies it across a streamed file and collapses failures
//! into compact page ranges.

use serde::{Deserialize, Serialize};

/// Default page size. Clusters compiled with a different block size are not
/// supported.
pub const PAGE_SIZE_DEFAULT: usize = 8192;

/// Page header offsets (PageHeaderData).
const PD_CHECKSUM_OFFSET: usize = 8;
const PD_UPPER_OFFSET: usize = 14;

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

/// Per-sum seed values, vendored from PostgreSQL's checksum implementation.
#[rustfmt::skip]
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A,
    0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA,
    0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE,
    0x737B3F75, 0xA42D301B, 0x55F319D7, 0xA2587CCB,
    0x10010A2E, 0xC1CA29A9, 0xA2D4D475, 0x91695A9C,
    0x85B907D4, 0x4CA28C8C, 0x6721BC7D, 0x89D02C89,
];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

fn checksum_block(page: &[u8]) -> u32 {
    debug_assert_eq!(page.len() % (N_SUMS * 4), 0);

    let mut sums = CHECKSUM_BASE_OFFSETS;
    let rows = page.len() / (N_SUMS * 4);

    for row in 0..rows {
        for (sum_no, sum) in sums.iter_mut().enumerate() {
            let offset = (row * N_SUMS + sum_no) * 4;
            let value = u32::from_le_bytes(page[offset..offset + 4].try_into().unwrap());
            *sum = checksum_comp(*sum, value);
        }
    }

    // Two rounds of zeroes to flush the last words through the mix.
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }

    sums.iter().fold(0, |result, sum| result ^ sum)
}

/// Compute the 16-bit checksum for a page. `block_no` is the block number
/// relative to the whole relation, not the segment file.
///
/// The stored checksum does not participate in its own computation, so the
/// header bytes are zeroed in a local copy before hashing.
pub fn checksum_page(page: &[u8], block_no: u32) -> u16 {
    let mut copy = page.to_vec();
    copy[PD_CHECKSUM_OFFSET] = 0;
    copy[PD_CHECKSUM_OFFSET + 1] = 0;

    let checksum = checksum_block(&copy) ^ block_no;
    (checksum % 65535 + 1) as u16
}

/// Stored checksum from a page header.
pub fn page_stored_checksum(page: &[u8]) -> u16 {
    u16::from_le_bytes(page[PD_CHECKSUM_OFFSET..PD_CHECKSUM_OFFSET + 2].try_into().unwrap())
}

/// `pd_upper` from a page header. Zero means the page is new and carries no
/// data yet, so it is valid regardless of its checksum.
pub fn page_upper(page: &[u8]) -> u16 {
    u16::from_le_bytes(page[PD_UPPER_OFFSET..PD_UPPER_OFFSET + 2].try_into().unwrap())
}

/// Page LSN from a page header (xlogid / xrecoff pair).
pub fn page_lsn(page: &[u8]) -> u64 {
    let xlogid = u32::from_le_bytes(page[0..4].try_into().unwrap());
    let xrecoff = u32::from_le_bytes(page[4..8].try_into().unwrap());
    ((xlogid as u64) << 32) | xrecoff as u64
}

/// A failed page or contiguous run of failed pages. Serialized into the
/// manifest as a bare page number or a `[first, last]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageRange {
    Single(u32),
    Range(u32, u32),
}

/// Outcome of verifying one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageVerifyResult {
    /// True when every page verified (or was skippable).
    pub valid: bool,
    /// False when the file size was not a multiple of the page size.
    pub align: bool,
    /// Failed pages, collapsed to ranges. Empty when valid.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error: Vec<PageRange>,
}

/// Incremental page verifier fed sequential chunks of one file.
///
/// `page_no_offset` positions this file within its relation so block numbers
/// stay relation-absolute across 1 GiB segment files. Pages whose LSN is at
/// or past `lsn_limit` were written after the backup started and will be
/// repaired from WAL on restore, so they are not tested.
pub struct PageVerifier {
    page_size: usize,
    lsn_limit: u64,
    page_no_offset: u32,
    pages_seen: u32,
    align: bool,
    failed: Vec<u32>,
}

impl PageVerifier {
    pub fn new(page_size: usize, lsn_limit: u64, page_no_offset: u32) -> Self {
        PageVerifier {
            page_size,
            lsn_limit,
            page_no_offset,
            pages_seen: 0,
            align: true,
            failed: Vec::new(),
        }
    }

    /// Verify the next chunk of the file. Callers must feed chunks that are
    /// multiples of the page size except possibly the last.
    pub fn update(&mut self, buf: &[u8]) {
        if !self.align {
            return;
        }

        if buf.len() % self.page_size != 0 {
            // Misaligned content. No page list is produced because block
            // boundaries can no longer be trusted.
            self.align = false;
            self.failed.clear();
            return;
        }

        for page in buf.chunks_exact(self.page_size) {
            let block_no = self.page_no_offset + self.pages_seen;
            self.pages_seen += 1;

            if page_upper(page) == 0 {
                continue;
            }

            if self.lsn_limit != 0 && page_lsn(page) >= self.lsn_limit {
                continue;
            }

            if page_stored_checksum(page) != checksum_page(page, block_no) {
                self.failed.push(block_no);
            }
        }
    }

    /// Collapse failures and produce the per-file result.
    pub fn finish(self) -> PageVerifyResult {
        if !self.align {
            return PageVerifyResult { valid: false, align: false, error: Vec::new() };
        }

        let mut error = Vec::new();
        let mut run: Option<(u32, u32)> = None;

        for &page in &self.failed {
            match run {
                Some((first, last)) if page == last + 1 => run = Some((first, page)),
                Some((first, last)) => {
                    error.push(if first == last {
                        PageRange::Single(first)
                    } else {
                        PageRange::Range(first, last)
                    });
                    run = Some((page, page));
                }
                None => run = Some((page, page)),
            }
        }

        if let Some((first, last)) = run {
            error.push(if first == last {
                PageRange::Single(first)
            } else {
                PageRange::Range(first, last)
            });
        }

        PageVerifyResult { valid: error.is_empty(), align: true, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a page with a valid checksum for its block number.
    pub(crate) fn valid_page(block_no: u32, fill: u8) -> Vec<u8> {
        let mut page = vec![fill; PAGE_SIZE_DEFAULT];
        // Plausible header: lsn low, pd_upper nonzero.
        page[0..8].copy_from_slice(&1u64.to_le_bytes());
        page[PD_UPPER_OFFSET] = 0xFF;

        let checksum = checksum_page(&page, block_no);
        page[PD_CHECKSUM_OFFSET..PD_CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_le_bytes());
        page
    }

    pub(crate) fn invalid_page(fill: u8) -> Vec<u8> {
        let mut page = vec![fill; PAGE_SIZE_DEFAULT];
        page[0..8].copy_from_slice(&1u64.to_le_bytes());
        page[PD_UPPER_OFFSET] = 0xFF;
        // Deliberately wrong checksum.
        page[PD_CHECKSUM_OFFSET] = 0xDE;
        page[PD_CHECKSUM_OFFSET + 1] = 0xAD;
        page
    }

    #[test]
    fn test_checksum_differs_by_block_no() {
        let page = vec![7u8; PAGE_SIZE_DEFAULT];
        assert_ne!(checksum_page(&page, 0), checksum_page(&page, 1));
    }

    #[test]
    fn test_checksum_ignores_stored_value() {
        let mut page = valid_page(3, 0x11);
        let before = checksum_page(&page, 3);
        page[PD_CHECKSUM_OFFSET] ^= 0xFF;
        assert_eq!(checksum_page(&page, 3), before);
    }

    #[test]
    fn test_new_page_always_valid() {
        // All zeroes: pd_upper == 0, checksum would not match but the page
        // is treated as a fresh extension.
        let page = vec![0u8; PAGE_SIZE_DEFAULT];
        let mut verifier = PageVerifier::new(PAGE_SIZE_DEFAULT, 0, 0);
        verifier.update(&page);
        let result = verifier.finish();
        assert!(result.valid);
        assert!(result.align);
        assert!(result.error.is_empty());
    }

    #[test]
    fn test_lsn_limit_skips_torn_pages() {
        let mut page = invalid_page(0x22);
        // Large LSN: written after the backup start.
        page[0..8].copy_from_slice(&u64::MAX.to_le_bytes());

        let mut verifier = PageVerifier::new(PAGE_SIZE_DEFAULT, 0x1000, 0);
        verifier.update(&page);
        assert!(verifier.finish().valid);
    }

    #[test]
    fn test_error_ranges_collapse() {
        let mut buf = Vec::new();
        buf.extend(invalid_page(0x01)); // page 0: bad
        buf.extend(valid_page(1, 0x02)); // page 1: good
        buf.extend(invalid_page(0x03)); // page 2: bad
        buf.extend(invalid_page(0x04)); // page 3: bad

        let mut verifier = PageVerifier::new(PAGE_SIZE_DEFAULT, 0, 0);
        verifier.update(&buf);
        let result = verifier.finish();

        assert!(!result.valid);
        assert_eq!(result.error, vec![PageRange::Single(0), PageRange::Range(2, 3)]);
    }

    #[test]
    fn test_page_no_offset_applies() {
        let page = valid_page(131072, 0x05);
        let mut verifier = PageVerifier::new(PAGE_SIZE_DEFAULT, 0, 131072);
        verifier.update(&page);
        assert!(verifier.finish().valid);
    }

    #[test]
    fn test_misaligned_file() {
        let mut buf = invalid_page(0x06);
        buf.extend_from_slice(&[0u8; 100]);

        let mut verifier = PageVerifier::new(PAGE_SIZE_DEFAULT, 0, 0);
        verifier.update(&buf);
        let result = verifier.finish();

        assert!(!result.valid);
        assert!(!result.align);
        assert!(result.error.is_empty(), "misaligned files carry no page list");
    }

    #[test]
    fn test_range_serialization() {
        let result = PageVerifyResult {
            valid: false,
            align: true,
            error: vec![PageRange::Single(0), PageRange::Range(2, 3)],
        };

        let json = serde_json::to_string(&result.error).unwrap();
        assert_eq!(json, "[0,[2,3]]");

        let back: Vec<PageRange> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result.error);
    }
}
