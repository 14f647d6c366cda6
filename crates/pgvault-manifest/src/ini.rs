//! The INI dialect manifests are persisted in.
//!
//! Sections hold `key=value` lines where every value is a JSON atom: strings
//! quoted, booleans literal, numbers unquoted, objects for structured
//! entries. The leading `[backrest]` section carries a format number and a
//! SHA-1 integrity checksum computed over the text with the checksum value
//! blanked.

use pgvault_common::{Error, Result};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

pub const CHECKSUM_SECTION: &str = "backrest";
pub const CHECKSUM_KEY: &str = "backrest-checksum";
pub const FORMAT_KEY: &str = "backrest-format";
pub const VERSION_KEY: &str = "backrest-version";

/// Version string written into every manifest, compared on resume.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Repository format number. Bumped only when the on-disk layout changes
/// incompatibly.
pub const REPO_FORMAT: u64 = 5;

/// An ordered INI document. Sections and keys sort lexicographically, which
/// places `[backrest]` first and makes serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniDoc {
    pub sections: BTreeMap<String, BTreeMap<String, Value>>,
}

impl IniDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections.get(section)?.get(key)
    }

    pub fn section(&self, section: &str) -> Option<&BTreeMap<String, Value>> {
        self.sections.get(section)
    }

    pub fn take_section(&mut self, section: &str) -> BTreeMap<String, Value> {
        self.sections.remove(section).unwrap_or_default()
    }

    /// Serialize to text. The checksum key, if present, is written with
    /// whatever value it currently holds.
    pub fn to_text(&self) -> String {
        let mut out = String::new();

        for (section, keys) in &self.sections {
            if !out.is_empty() {
                out.push('\n');
            }

            out.push('[');
            out.push_str(section);
            out.push_str("]\n");

            for (key, value) in keys {
                out.push_str(key);
                out.push('=');
                // Compact JSON with sorted object keys keeps the output
                // byte-stable across round trips.
                out.push_str(&value.to_string());
                out.push('\n');
            }
        }

        out
    }

    /// Parse text into a document. Malformed lines fail hard: a manifest is
    /// never partially trusted.
    pub fn from_text(text: &str) -> Result<Self> {
        let mut doc = IniDoc::new();
        let mut current: Option<String> = None;

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim_end();

            if line.is_empty() {
                continue;
            }

            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(section.to_string());
                doc.sections.entry(section.to_string()).or_default();
                continue;
            }

            let section = current
                .as_ref()
                .ok_or_else(|| Error::Format(format!("key before any section at line {}", line_no + 1)))?;

            let (key, raw) = line
                .split_once('=')
                .ok_or_else(|| Error::Format(format!("missing '=' at line {}", line_no + 1)))?;

            let value: Value = serde_json::from_str(raw).map_err(|_| {
                Error::Format(format!("invalid value for '{key}' at line {}", line_no + 1))
            })?;

            doc.sections
                .entry(section.clone())
                .or_default()
                .insert(key.to_string(), value);
        }

        Ok(doc)
    }
}

/// SHA-1 over `text` with the checksum value replaced by the empty string,
/// hex-encoded. This is the integrity checksum stored in, and verified
/// against, the `backrest-checksum` key.
pub fn integrity_checksum(text: &str) -> String {
    let mut hasher = Sha1::new();

    for line in text.lines() {
        if line.starts_with(CHECKSUM_KEY) && line.as_bytes().get(CHECKSUM_KEY.len()) == Some(&b'=') {
            hasher.update(CHECKSUM_KEY.as_bytes());
            hasher.update(b"=\"\"\n");
        } else {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
    }

    hex::encode(hasher.finalize())
}

/// Render a document with a freshly computed integrity checksum.
pub fn to_text_with_checksum(doc: &mut IniDoc) -> String {
    doc.set(CHECKSUM_SECTION, CHECKSUM_KEY, Value::String(String::new()));
    doc.set(CHECKSUM_SECTION, FORMAT_KEY, Value::from(REPO_FORMAT));
    doc.set(CHECKSUM_SECTION, VERSION_KEY, Value::String(ENGINE_VERSION.to_string()));

    let text = doc.to_text();
    let checksum = integrity_checksum(&text);
    doc.set(CHECKSUM_SECTION, CHECKSUM_KEY, Value::String(checksum));

    doc.to_text()
}

/// Engine version recorded in manifest text, without verifying integrity.
/// Used by the resume analyzer, which must not trust the rest of the file
/// before deciding anything.
pub fn manifest_version(text: &str) -> Option<String> {
    let doc = IniDoc::from_text(text).ok()?;
    doc.get(CHECKSUM_SECTION, VERSION_KEY)?.as_str().map(String::from)
}

/// Parse a document and verify its integrity checksum and format number.
pub fn from_text_checked(text: &str) -> Result<IniDoc> {
    let doc = IniDoc::from_text(text)?;

    let stored = doc
        .get(CHECKSUM_SECTION, CHECKSUM_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Checksum("missing integrity checksum".into()))?;

    let actual = integrity_checksum(text);

    if stored != actual {
        return Err(Error::Checksum(format!(
            "checksum '{stored}' does not match calculated '{actual}'"
        )));
    }

    match doc.get(CHECKSUM_SECTION, FORMAT_KEY).and_then(Value::as_u64) {
        Some(REPO_FORMAT) => Ok(doc),
        Some(format) => Err(Error::Format(format!(
            "expected format {REPO_FORMAT} but found {format}"
        ))),
        None => Err(Error::Format("missing format number".into())),
    }
}
