//! Backup label generation and parsing.
//!
//! Labels are derived from the backup start time: `YYYYMMDD-HHMMSSF` for a
//! full backup, `<full>_YYYYMMDD-HHMMSSD` for a differential, and
//! `<full>_YYYYMMDD-HHMMSSI` for an incremental. Because the dependent label
//! embeds its full backup's label as a prefix, lexicographic order over all
//! labels in a stanza matches creation order.

use crate::error::{Error, Result};
use crate::types::BackupType;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};

const LABEL_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

/// A validated backup label.
pub type BackupLabel = String;

fn format_label(backup_type: BackupType, prior_full: Option<&str>, time: DateTime<Utc>) -> String {
    let stamp = time.format(LABEL_TIME_FORMAT);

    match backup_type {
        BackupType::Full => format!("{stamp}F"),
        BackupType::Differential => format!("{}_{stamp}D", prior_full.unwrap_or_default()),
        BackupType::Incremental => format!("{}_{stamp}I", prior_full.unwrap_or_default()),
    }
}

/// Generate a unique label for a backup starting at `time`.
///
/// `prior_full` is the label of the dependency full backup, required for
/// differential and incremental types. `exists` reports whether a label is
/// already taken in the stanza. A collision advances the time by one second;
/// if the advanced label still collides the stanza clock is broken and the
/// error names both labels.
pub fn backup_label(
    backup_type: BackupType,
    prior_full: Option<&str>,
    time: DateTime<Utc>,
    exists: impl Fn(&str) -> bool,
) -> Result<String> {
    if backup_type != BackupType::Full && prior_full.is_none() {
        return Err(Error::Assert(format!(
            "{backup_type} backup label requires a prior full label"
        )));
    }

    let label = format_label(backup_type, prior_full, time);

    if !exists(&label) {
        return Ok(label);
    }

    let advanced = format_label(backup_type, prior_full, time + Duration::seconds(1));

    if exists(&advanced) {
        return Err(Error::Format(format!(
            "new backup label '{advanced}' (advanced from '{label}') is not unique"
        )));
    }

    Ok(advanced)
}

/// The type encoded in a label's trailing character.
pub fn label_type(label: &str) -> Result<BackupType> {
    match label.chars().last() {
        Some('F') => Ok(BackupType::Full),
        Some('D') => Ok(BackupType::Differential),
        Some('I') => Ok(BackupType::Incremental),
        _ => Err(Error::Format(format!("invalid backup label '{label}'"))),
    }
}

/// The full-backup label a dependent label was derived from. For a full
/// backup this is the label itself.
pub fn label_full_part(label: &str) -> Result<&str> {
    match label_type(label)? {
        BackupType::Full => Ok(label),
        _ => label
            .split('_')
            .next()
            .filter(|full| matches!(label_type(full), Ok(BackupType::Full)))
            .ok_or_else(|| Error::Format(format!("invalid backup label '{label}'"))),
    }
}

/// The start time encoded in a label's own (last) timestamp component.
pub fn label_timestamp(label: &str) -> Result<DateTime<Utc>> {
    label_type(label)?;

    let stamp = &label[label.rfind('_').map(|i| i + 1).unwrap_or(0)..label.len() - 1];

    NaiveDateTime::parse_from_str(stamp, LABEL_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::Format(format!("invalid backup label '{label}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(text: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_label_format() {
        let time = at("2019-10-02 17:10:31");

        let full = backup_label(BackupType::Full, None, time, |_| false).unwrap();
        assert_eq!(full, "20191002-171031F");

        let diff = backup_label(BackupType::Differential, Some(&full), time, |_| false).unwrap();
        assert_eq!(diff, "20191002-171031F_20191002-171031D");

        let incr = backup_label(BackupType::Incremental, Some(&full), time, |_| false).unwrap();
        assert_eq!(incr, "20191002-171031F_20191002-171031I");
    }

    #[test]
    fn test_label_collision_advances_one_second() {
        let time = at("2019-10-02 17:10:31");

        let label =
            backup_label(BackupType::Full, None, time, |l| l == "20191002-171031F").unwrap();
        assert_eq!(label, "20191002-171032F");
    }

    #[test]
    fn test_label_double_collision_fails() {
        let time = at("2019-10-02 17:10:31");

        let err = backup_label(BackupType::Full, None, time, |_| true).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_label_sorts_by_creation_order() {
        let full1 = "20191002-171031F";
        let incr1 = "20191002-171031F_20191002-180000I";
        let diff1 = "20191002-171031F_20191003-171031D";
        let full2 = "20191004-171031F";

        let mut labels = vec![full2, diff1, full1, incr1];
        labels.sort();
        assert_eq!(labels, vec![full1, incr1, diff1, full2]);
    }

    #[test]
    fn test_label_parse() {
        assert_eq!(label_type("20191002-171031F").unwrap(), BackupType::Full);
        assert_eq!(
            label_type("20191002-171031F_20191003-171031D").unwrap(),
            BackupType::Differential
        );
        assert_eq!(
            label_full_part("20191002-171031F_20191003-171031I").unwrap(),
            "20191002-171031F"
        );
        assert_eq!(
            label_timestamp("20191002-171031F_20191003-171031D").unwrap(),
            at("2019-10-03 17:10:31")
        );
        assert!(label_type("junk").is_err());
        assert!(label_full_part("20191003-171031D").is_err());
    }

    #[test]
    fn test_dependent_label_requires_full() {
        let time = at("2019-10-02 17:10:31");
        let err = backup_label(BackupType::Incremental, None, time, |_| false).unwrap_err();
        assert!(matches!(err, Error::Assert(_)));
    }
}
