//! Per-file copy worker.
//!
//! One call copies one cluster file into the repository through the filter
//! pipeline: source reader → optional page verification → SHA-1/size tee →
//! optional compression → optional encryption → repository writer. The same
//! function runs in-process for local storage and behind the subprocess
//! protocol for remote hosts.

use pgvault_common::{CipherType, CompressionType, Error, Result};
use pgvault_postgres::{PageVerifier, PageVerifyResult};
use pgvault_storage::{CipherWriter, CompressWriter, CountingWriter, DigestWriter, Storage};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use tracing::debug;

/// What happened to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyResultTag {
    /// File was streamed into the repository.
    Copied,
    /// Source vanished and the job allowed it.
    Skipped,
    /// Delta verification matched; nothing written.
    Noop,
    /// A resumed artifact was stale and was streamed again.
    Recopied,
    /// A resumed artifact verified against the source; kept as is.
    ChecksumMatch,
}

impl CopyResultTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copied => "copied",
            Self::Skipped => "skipped",
            Self::Noop => "noop",
            Self::Recopied => "recopied",
            Self::ChecksumMatch => "checksumMatch",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "copied" => Ok(Self::Copied),
            "skipped" => Ok(Self::Skipped),
            "noop" => Ok(Self::Noop),
            "recopied" => Ok(Self::Recopied),
            "checksumMatch" => Ok(Self::ChecksumMatch),
            other => Err(Error::Format(format!("invalid copy result '{other}'"))),
        }
    }
}

/// Result of one file copy.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyResult {
    pub tag: CopyResultTag,
    /// Bytes read from the source (exactly what the checksum covers).
    pub copy_size: u64,
    /// Bytes stored in the repository for this file in this backup.
    pub repo_size: u64,
    /// SHA-1 of the bytes read.
    pub checksum: String,
    /// Page verification outcome, when requested.
    pub page_result: Option<PageVerifyResult>,
}

impl CopyResult {
    /// Protocol `out` payload: `[tag, copySize, repoSize, checksum, pageResult]`.
    pub fn to_out(&self) -> Vec<Value> {
        vec![
            json!(self.tag.as_str()),
            json!(self.copy_size),
            json!(self.repo_size),
            json!(self.checksum),
            self.page_result.as_ref().map_or(Value::Null, |p| {
                serde_json::to_value(p).unwrap_or(Value::Null)
            }),
        ]
    }

    pub fn from_out(out: &[Value]) -> Result<Self> {
        if out.len() != 5 {
            return Err(Error::Format(format!("copy result has {} fields, expected 5", out.len())));
        }

        Ok(CopyResult {
            tag: CopyResultTag::parse(
                out[0].as_str().ok_or_else(|| Error::Format("invalid result tag".into()))?,
            )?,
            copy_size: out[1]
                .as_u64()
                .ok_or_else(|| Error::Format("invalid copy size".into()))?,
            repo_size: out[2]
                .as_u64()
                .ok_or_else(|| Error::Format("invalid repo size".into()))?,
            checksum: out[3]
                .as_str()
                .ok_or_else(|| Error::Format("invalid checksum".into()))?
                .to_string(),
            page_result: match &out[4] {
                Value::Null => None,
                value => Some(
                    serde_json::from_value(value.clone())
                        .map_err(|_| Error::Format("invalid page result".into()))?,
                ),
            },
        })
    }
}

/// Everything the worker needs to copy one file.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupFileRequest {
    /// Path of the source file relative to the cluster storage base.
    pub source_name: String,
    /// Skip rather than fail when the source has vanished.
    pub ignore_missing: bool,
    /// Size recorded when the manifest was built.
    pub expected_size: u64,
    /// Read exactly `expected_size` bytes even if the file has grown.
    pub copy_exact_size: bool,
    /// Known checksum from a prior backup or resumed attempt.
    pub expected_checksum: Option<String>,
    pub check_pages: bool,
    /// Pages with an LSN at or past this limit are not checksum-tested.
    pub page_lsn_limit: u64,
    /// Block-number offset of this file within its relation.
    pub page_no_offset: u32,
    /// Manifest name; also the repository-relative artifact name.
    pub repo_name: String,
    /// The manifest entry carries a reference to a prior backup.
    pub has_reference: bool,
    pub compress_type: CompressionType,
    pub compress_level: u32,
    /// Label of the backup being written.
    pub label: String,
    pub delta: bool,
    pub cipher_type: CipherType,
    pub cipher_pass: Option<String>,
    pub page_size: u32,
    /// The artifact already exists from a resumed attempt; verify and keep
    /// or recopy.
    pub resumable: bool,
}

impl BackupFileRequest {
    /// Positional protocol parameters, in contract order.
    pub fn to_param(&self) -> Vec<Value> {
        vec![
            json!(self.source_name),
            json!(self.ignore_missing),
            json!(self.expected_size),
            json!(self.copy_exact_size),
            self.expected_checksum.as_deref().map_or(Value::Null, Value::from),
            json!(self.check_pages),
            json!(self.page_lsn_limit),
            json!(self.page_no_offset),
            json!(self.repo_name),
            json!(self.has_reference),
            json!(self.compress_type.as_str()),
            json!(self.compress_level),
            json!(self.label),
            json!(self.delta),
            json!(self.cipher_type.as_str()),
            self.cipher_pass.as_deref().map_or(Value::Null, Value::from),
            json!(self.page_size),
            json!(self.resumable),
        ]
    }

    pub fn from_param(param: &[Value]) -> Result<Self> {
        if param.len() != 18 {
            return Err(Error::Format(format!(
                "backupFile has {} parameters, expected 18",
                param.len()
            )));
        }

        let text = |index: usize| -> Result<String> {
            param[index]
                .as_str()
                .map(String::from)
                .ok_or_else(|| Error::Format(format!("parameter {index} is not a string")))
        };
        let boolean = |index: usize| -> Result<bool> {
            param[index]
                .as_bool()
                .ok_or_else(|| Error::Format(format!("parameter {index} is not a boolean")))
        };
        let number = |index: usize| -> Result<u64> {
            param[index]
                .as_u64()
                .ok_or_else(|| Error::Format(format!("parameter {index} is not a number")))
        };
        let optional = |index: usize| -> Result<Option<String>> {
            match &param[index] {
                Value::Null => Ok(None),
                Value::String(text) => Ok(Some(text.clone())),
                _ => Err(Error::Format(format!("parameter {index} is not a string or null"))),
            }
        };

        Ok(BackupFileRequest {
            source_name: text(0)?,
            ignore_missing: boolean(1)?,
            expected_size: number(2)?,
            copy_exact_size: boolean(3)?,
            expected_checksum: optional(4)?,
            check_pages: boolean(5)?,
            page_lsn_limit: number(6)?,
            page_no_offset: number(7)? as u32,
            repo_name: text(8)?,
            has_reference: boolean(9)?,
            compress_type: CompressionType::parse(&text(10)?)?,
            compress_level: number(11)? as u32,
            label: text(12)?,
            delta: boolean(13)?,
            cipher_type: CipherType::parse(&text(14)?)?,
            cipher_pass: optional(15)?,
            page_size: number(16)? as u32,
            resumable: boolean(17)?,
        })
    }
}

enum WriteChain {
    Plain(CompressWriter<CountingWriter<Box<dyn Write + Send>>>),
    Encrypted(CompressWriter<CipherWriter<CountingWriter<Box<dyn Write + Send>>>>),
}

impl WriteChain {
    fn new(sink: Box<dyn Write + Send>, request: &BackupFileRequest) -> Result<Self> {
        let counting = CountingWriter::new(sink);

        match request.cipher_type {
            CipherType::None => Ok(WriteChain::Plain(CompressWriter::new(
                counting,
                request.compress_type,
                request.compress_level,
            )?)),
            CipherType::Aes256Gcm => {
                let pass = request.cipher_pass.as_deref().ok_or_else(|| {
                    Error::Cipher("cipher type set but no passphrase given".into())
                })?;
                let cipher = CipherWriter::new(counting, pass)?;
                Ok(WriteChain::Encrypted(CompressWriter::new(
                    cipher,
                    request.compress_type,
                    request.compress_level,
                )?))
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            WriteChain::Plain(writer) => writer.write_all(buf),
            WriteChain::Encrypted(writer) => writer.write_all(buf),
        }
    }

    fn finish(self) -> Result<u64> {
        match self {
            WriteChain::Plain(writer) => {
                let (mut inner, bytes) = writer.finish()?.finish();
                inner.flush()?;
                Ok(bytes)
            }
            WriteChain::Encrypted(writer) => {
                let (mut inner, bytes) = writer.finish()?.finish()?.finish();
                inner.flush()?;
                Ok(bytes)
            }
        }
    }
}

/// Repository path of the artifact this request writes, relative to the
/// backup directory it belongs to.
pub fn artifact_name(request: &BackupFileRequest) -> String {
    request.compress_type.apply_extension(&request.repo_name)
}

fn open_source(
    source: &dyn Storage,
    request: &BackupFileRequest,
) -> Result<Option<Box<dyn Read + Send>>> {
    match source.read(&request.source_name) {
        Ok(reader) => Ok(Some(reader)),
        Err(err) if err.is_file_missing() => {
            if request.ignore_missing {
                debug!(file = %request.source_name, "source missing, skipping");
                Ok(None)
            } else {
                Err(Error::FileMissing(request.source_name.clone()))
            }
        }
        Err(err) => Err(err),
    }
}

fn skipped() -> CopyResult {
    CopyResult {
        tag: CopyResultTag::Skipped,
        copy_size: 0,
        repo_size: 0,
        checksum: String::new(),
        page_result: None,
    }
}

/// Digest (and optionally page-verify) the source without writing anything.
fn digest_source(
    reader: Box<dyn Read + Send>,
    request: &BackupFileRequest,
    buffer_size: usize,
    limit: Option<u64>,
) -> Result<(String, u64, Option<PageVerifyResult>)> {
    let mut reader: Box<dyn Read + Send> = match limit {
        Some(limit) => Box::new(reader.take(limit)),
        None => reader,
    };

    let mut hasher = Sha1::new();
    let mut verifier = request
        .check_pages
        .then(|| PageVerifier::new(request.page_size as usize, request.page_lsn_limit, request.page_no_offset));
    let mut bytes = 0u64;
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }

        hasher.update(&buf[..read]);
        if let Some(verifier) = verifier.as_mut() {
            verifier.update(&buf[..read]);
        }
        bytes += read as u64;
    }

    Ok((hex::encode(hasher.finalize()), bytes, verifier.map(PageVerifier::finish)))
}

fn stream_copy(
    reader: Box<dyn Read + Send>,
    repo: &dyn Storage,
    repo_path: &str,
    request: &BackupFileRequest,
    buffer_size: usize,
    tag: CopyResultTag,
) -> Result<CopyResult> {
    let mut reader: Box<dyn Read + Send> = if request.copy_exact_size {
        Box::new(reader.take(request.expected_size))
    } else {
        reader
    };

    let mut verifier = request
        .check_pages
        .then(|| PageVerifier::new(request.page_size as usize, request.page_lsn_limit, request.page_no_offset));

    let mut digest = DigestWriter::new(WriteChain::new(repo.write(repo_path)?, request)?);
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }

        if let Some(verifier) = verifier.as_mut() {
            verifier.update(&buf[..read]);
        }
        digest.write_all(&buf[..read])?;
    }

    let (chain, checksum, copy_size) = digest.finish();
    let repo_size = chain.finish()?;

    debug!(
        file = %request.source_name,
        copy_size,
        repo_size,
        tag = tag.as_str(),
        "file copied"
    );

    Ok(CopyResult {
        tag,
        copy_size,
        repo_size,
        checksum,
        page_result: verifier.map(PageVerifier::finish),
    })
}

/// Copy one file into the repository.
///
/// `repo_path` is the full repository-relative destination including the
/// compression extension; callers derive it with [`artifact_name`].
pub fn backup_file(
    source: &dyn Storage,
    repo: &dyn Storage,
    repo_path: &str,
    request: &BackupFileRequest,
    buffer_size: usize,
) -> Result<CopyResult> {
    let Some(reader) = open_source(source, request)? else {
        return Ok(skipped());
    };

    // A resumed artifact is kept when the source still matches the checksum
    // the interrupted backup recorded for it.
    if request.resumable {
        if let Some(expected) = request.expected_checksum.clone() {
            let (checksum, bytes, page_result) =
                digest_source(reader, request, buffer_size, None)?;

            if checksum == expected && bytes == request.expected_size && repo.exists(repo_path)? {
                let repo_size = repo.info(repo_path)?.size;
                return Ok(CopyResult {
                    tag: CopyResultTag::ChecksumMatch,
                    copy_size: bytes,
                    repo_size,
                    checksum,
                    page_result,
                });
            }

            let Some(reader) = open_source(source, request)? else {
                return Ok(skipped());
            };
            return stream_copy(reader, repo, repo_path, request, buffer_size, CopyResultTag::Recopied);
        }
    }

    // Delta: when the source still hashes to the prior checksum there is
    // nothing to copy. The file may have grown concurrently;
    // `copy_exact_size` bounds the comparison to the recorded size.
    if request.delta {
        if let Some(expected) = request.expected_checksum.clone() {
            let limit = request.copy_exact_size.then_some(request.expected_size);
            let (checksum, _bytes, _pages) = digest_source(reader, request, buffer_size, limit)?;

            if checksum == expected {
                return Ok(CopyResult {
                    tag: CopyResultTag::Noop,
                    copy_size: request.expected_size,
                    repo_size: 0,
                    checksum,
                    page_result: None,
                });
            }

            let Some(reader) = open_source(source, request)? else {
                return Ok(skipped());
            };
            return stream_copy(reader, repo, repo_path, request, buffer_size, CopyResultTag::Copied);
        }
    }

    stream_copy(reader, repo, repo_path, request, buffer_size, CopyResultTag::Copied)
}

/// Store an in-memory blob (`backup_label`, `tablespace_map`) through the
/// same pipeline as a regular file.
pub fn store_blob(
    repo: &dyn Storage,
    repo_path: &str,
    content: &[u8],
    request: &BackupFileRequest,
) -> Result<CopyResult> {
    let mut chain = WriteChain::new(repo.write(repo_path)?, request)?;
    chain.write_all(content)?;
    let repo_size = chain.finish()?;

    Ok(CopyResult {
        tag: CopyResultTag::Copied,
        copy_size: content.len() as u64,
        repo_size,
        checksum: hex::encode(Sha1::digest(content)),
        page_result: None,
    })
}

impl Write for WriteChain {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            WriteChain::Plain(writer) => writer.write(buf),
            WriteChain::Encrypted(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            WriteChain::Plain(writer) => writer.flush(),
            WriteChain::Encrypted(writer) => writer.flush(),
        }
    }
}
