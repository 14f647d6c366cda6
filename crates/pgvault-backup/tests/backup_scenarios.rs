//! End-to-end backup scenarios against fabricated clusters.

use chrono::{DateTime, NaiveDateTime, Utc};
use pgvault_backup::{
    BackupContext, BackupController, BackupOptions, DbAnswer, DbCall, RepoLayout, ScriptedDb,
    StanzaInfo, StartBackupResult, StopBackupResult,
};
use pgvault_common::{BackupType, Error};
use pgvault_manifest::Manifest;
use pgvault_postgres::version::{PG_VERSION_11, PG_VERSION_84, PG_VERSION_95, PG_VERSION_96};
use pgvault_postgres::{checksum_page, PageRange, PgControl, PgVersion, PAGE_SIZE_DEFAULT};
use pgvault_storage::{LocalStorage, Storage};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SYSTEM_ID: u64 = 6569239123849665679;
const CONFIG_SHA1: &str = "e3db315c260e79211b7b52587123b7aa060f30ab";

fn at(text: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap().and_utc()
}

fn control(version: PgVersion, page_checksum: bool) -> PgControl {
    PgControl {
        version,
        system_id: SYSTEM_ID,
        catalog_version: PgControl::catalog_version_for(version).unwrap(),
        checkpoint: 0x2800_0028,
        page_size: PAGE_SIZE_DEFAULT as u32,
        wal_segment_size: pgvault_postgres::WAL_SEGMENT_SIZE_DEFAULT,
        page_checksum,
    }
}

/// Fabricate a minimal cluster: postgresql.conf + global/pg_control.
fn make_cluster(dir: &TempDir, version: PgVersion, page_checksum: bool) -> PathBuf {
    let data = dir.path().join("pg");
    std::fs::create_dir_all(data.join("global")).unwrap();
    std::fs::write(data.join("postgresql.conf"), b"CONFIGSTUFF").unwrap();
    std::fs::write(
        data.join("global/pg_control"),
        control(version, page_checksum).to_bytes().unwrap(),
    )
    .unwrap();
    data
}

fn offline_context(dir: &TempDir, data: PathBuf, version: PgVersion) -> BackupContext {
    BackupContext {
        options: BackupOptions {
            stanza: "demo".into(),
            online: false,
            archive_check: false,
            start_time: Some(at("2019-10-02 17:10:31")),
            ..Default::default()
        },
        repo: Arc::new(LocalStorage::new(dir.path().join("repo"))),
        pg: Arc::new(LocalStorage::new(&data)),
        pg_path: data,
        standby_pg: None,
        primary: None,
        standby: None,
        stanza_info: StanzaInfo { version, system_id: SYSTEM_ID },
    }
}

fn start_result(lsn: &str, segment: &str) -> StartBackupResult {
    StartBackupResult { lsn: lsn.parse().unwrap(), wal_segment: segment.into(), timeline: 1 }
}

fn stop_result(lsn: &str, segment: &str, exclusive: bool) -> StopBackupResult {
    StopBackupResult {
        lsn: lsn.parse().unwrap(),
        wal_segment: segment.into(),
        backup_label: (!exclusive).then(|| "START WAL LOCATION: 0/28000028\n".to_string()),
        tablespace_map: None,
        timestamp: at("2019-10-02 17:12:00").timestamp(),
    }
}

/// Standard online script: probe, lock, start, copy-start clock, no
/// tablespaces, stop.
fn online_script(version_num: u32, exclusive: bool) -> Vec<(DbCall, DbAnswer)> {
    vec![
        (DbCall::ServerVersion, DbAnswer::Version(version_num)),
        (DbCall::IsStandby, DbAnswer::Bool(false)),
        (DbCall::AdvisoryLock, DbAnswer::Bool(true)),
        (
            DbCall::StartBackup { exclusive },
            DbAnswer::Start(start_result("0/28000028", "000000010000000000000028")),
        ),
        (DbCall::CurrentTime, DbAnswer::Time(at("2019-10-02 17:10:32"))),
        (DbCall::TablespaceList, DbAnswer::Tablespaces(vec![])),
        (
            DbCall::StopBackup { exclusive },
            DbAnswer::Stop(stop_result("0/28000130", "000000010000000000000028", exclusive)),
        ),
    ]
}

fn file_mtime(path: &std::path::Path) -> i64 {
    std::fs::metadata(path).unwrap().mtime()
}

// ---------------------------------------------------------------------------
// Scenario 1: offline 8.4 full backup mirrors the cluster exactly.
// ---------------------------------------------------------------------------
#[tokio::test]
async fn offline_full_backup_mirrors_cluster() {
    let dir = TempDir::new().unwrap();
    let data = make_cluster(&dir, PG_VERSION_84, false);

    let context = offline_context(&dir, data.clone(), PG_VERSION_84);
    let repo = context.repo.clone();

    let result = BackupController::new(context).run().await.unwrap();

    assert_eq!(result.label, "20191002-171031F");
    assert_eq!(result.backup_type, BackupType::Full);
    assert_eq!(result.manifest.file_list().len(), 2);

    let conf = result.manifest.file("pg_data/postgresql.conf").unwrap();
    assert_eq!(conf.size, 11);
    assert_eq!(conf.checksum, CONFIG_SHA1);

    let pg_control = result.manifest.file("pg_data/global/pg_control").unwrap();
    assert_eq!(pg_control.size, 8192);

    // The repository mirrors the cluster byte for byte.
    let backup_dir = "demo/backup/20191002-171031F";
    assert_eq!(
        repo.read_all(&format!("{backup_dir}/pg_data/postgresql.conf")).unwrap(),
        b"CONFIGSTUFF"
    );
    assert_eq!(
        repo.read_all(&format!("{backup_dir}/pg_data/global/pg_control")).unwrap(),
        std::fs::read(data.join("global/pg_control")).unwrap()
    );

    // Published atomically: manifest, copy, and latest pointer.
    assert!(repo.exists(&format!("{backup_dir}/backup.manifest")).unwrap());
    assert!(repo.exists(&format!("{backup_dir}/backup.manifest.copy")).unwrap());
    assert_eq!(
        repo.read_link("demo/backup/latest").unwrap().as_deref(),
        Some("20191002-171031F")
    );

    assert_eq!(result.stats.copied, 2);
}

// ---------------------------------------------------------------------------
// Scenario 1b: offline backup refused while the postmaster runs.
// ---------------------------------------------------------------------------
#[tokio::test]
async fn offline_backup_refused_with_postmaster() {
    let dir = TempDir::new().unwrap();
    let data = make_cluster(&dir, PG_VERSION_84, false);
    std::fs::write(data.join("postmaster.pid"), b"12345").unwrap();

    let context = offline_context(&dir, data.clone(), PG_VERSION_84);
    let repo = context.repo.clone();

    let err = BackupController::new(context).run().await.unwrap_err();
    assert!(matches!(err, Error::PostmasterRunning(_)));

    // Pre-StartBackup failure leaves no repository state.
    assert!(repo.list("demo/backup").unwrap().is_empty());

    // --force overrides.
    let mut context = offline_context(&dir, data, PG_VERSION_84);
    context.options.force = true;
    BackupController::new(context).run().await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 2: online 9.5 full with resume reuses the verified artifact.
// ---------------------------------------------------------------------------
#[tokio::test]
async fn online_full_resume_reuses_artifacts() {
    let dir = TempDir::new().unwrap();
    let data = make_cluster(&dir, PG_VERSION_95, false);
    std::fs::write(data.join("PG_VERSION"), b"9.5\n").unwrap();

    let repo = Arc::new(LocalStorage::new(dir.path().join("repo")));
    let layout = RepoLayout::new("demo");

    // Seed the partial attempt: a saved manifest naming PG_VERSION with the
    // live checksum/size/timestamp, and the artifact itself.
    let saved_label = "20191002-000000F";
    {
        let mtime = file_mtime(&data.join("PG_VERSION"));
        let checksum = pgvault_storage::filter::sha1_hex(b"9.5\n");

        let mut saved = seed_manifest(saved_label, BackupType::Full);
        let mut entry = pgvault_manifest::FileEntry::new(
            "pg_data/PG_VERSION",
            4,
            mtime,
            &pgvault_manifest::Defaults::default(),
        );
        entry.checksum = checksum;
        entry.repo_size = Some(4);
        saved.add_file(entry).unwrap();

        let partial = layout.partial_dir(saved_label);
        repo.write_atomic(
            &layout.manifest_copy(&partial),
            saved.to_text().unwrap().as_bytes(),
        )
        .unwrap();
        repo.write_atomic(&format!("{partial}/pg_data/PG_VERSION"), b"9.5\n").unwrap();
    }

    let context = BackupContext {
        options: BackupOptions {
            stanza: "demo".into(),
            archive_check: false,
            start_time: Some(at("2019-10-02 17:10:31")),
            ..Default::default()
        },
        repo: repo.clone(),
        pg: Arc::new(LocalStorage::new(&data)),
        pg_path: data,
        standby_pg: None,
        primary: Some(Arc::new(ScriptedDb::new(online_script(90510, true)))),
        standby: None,
        stanza_info: StanzaInfo { version: PG_VERSION_95, system_id: SYSTEM_ID },
    };

    let result = BackupController::new(context).run().await.unwrap();

    assert_eq!(result.stats.checksum_match, 1, "PG_VERSION verified in place");
    assert_eq!(result.stats.copied, 2, "pg_control and postgresql.conf copied");
    assert_eq!(result.stats.recopied, 0);

    // The partial directory was adopted and published under the new label.
    assert!(!repo.exists(&layout.partial_dir(saved_label)).unwrap());
    assert!(repo.exists(&layout.backup_dir(&result.label)).unwrap());
}

// ---------------------------------------------------------------------------
// Scenario 3: online 9.5 differential references the prior full.
// ---------------------------------------------------------------------------
#[tokio::test]
async fn online_differential_references_prior() {
    let dir = TempDir::new().unwrap();
    let data = make_cluster(&dir, PG_VERSION_95, false);
    std::fs::write(data.join("PG_VERSION"), b"9.5\n").unwrap();

    let repo = Arc::new(LocalStorage::new(dir.path().join("repo")));

    // First: a published full backup.
    let full = BackupController::new(BackupContext {
        options: BackupOptions {
            stanza: "demo".into(),
            archive_check: false,
            start_time: Some(at("2019-10-02 17:10:31")),
            ..Default::default()
        },
        repo: repo.clone(),
        pg: Arc::new(LocalStorage::new(&data)),
        pg_path: data.clone(),
        standby_pg: None,
        primary: Some(Arc::new(ScriptedDb::new(online_script(90510, true)))),
        standby: None,
        stanza_info: StanzaInfo { version: PG_VERSION_95, system_id: SYSTEM_ID },
    })
    .run()
    .await
    .unwrap();

    assert_eq!(full.label, "20191002-171031F");

    // A new file appears; everything else is untouched.
    std::fs::write(data.join("pg_hba.conf"), b"host all all trust\n").unwrap();

    let diff = BackupController::new(BackupContext {
        options: BackupOptions {
            stanza: "demo".into(),
            backup_type: BackupType::Differential,
            archive_check: false,
            start_time: Some(at("2019-10-03 17:10:31")),
            ..Default::default()
        },
        repo: repo.clone(),
        pg: Arc::new(LocalStorage::new(&data)),
        pg_path: data,
        standby_pg: None,
        primary: Some(Arc::new(ScriptedDb::new(online_script(90510, true)))),
        standby: None,
        stanza_info: StanzaInfo { version: PG_VERSION_95, system_id: SYSTEM_ID },
    })
    .run()
    .await
    .unwrap();

    assert_eq!(diff.label, "20191002-171031F_20191003-171031D");
    assert_eq!(diff.backup_type, BackupType::Differential);
    assert_eq!(diff.stats.copied, 1, "only the new file is copied");

    // The three unchanged files are references to the full backup.
    let referenced: Vec<&str> = diff
        .manifest
        .file_list()
        .iter()
        .filter(|f| f.reference.as_deref() == Some("20191002-171031F"))
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(
        referenced,
        vec!["pg_data/PG_VERSION", "pg_data/global/pg_control", "pg_data/postgresql.conf"]
    );

    // Differential size is exactly the new file.
    assert_eq!(diff.manifest.repo_total_size(), 19);

    // The referenced bytes are not duplicated in the new directory.
    assert!(!repo
        .exists("demo/backup/20191002-171031F_20191003-171031D/pg_data/PG_VERSION")
        .unwrap());
    assert!(repo
        .exists("demo/backup/20191002-171031F_20191003-171031D/pg_data/pg_hba.conf")
        .unwrap());
}

// ---------------------------------------------------------------------------
// Delta idempotence: a second run over an unchanged cluster copies nothing.
// ---------------------------------------------------------------------------
#[tokio::test]
async fn delta_second_run_copies_nothing() {
    let dir = TempDir::new().unwrap();
    let data = make_cluster(&dir, PG_VERSION_95, false);

    let repo = Arc::new(LocalStorage::new(dir.path().join("repo")));

    let make_context = |backup_type, delta, time: &str| BackupContext {
        options: BackupOptions {
            stanza: "demo".into(),
            backup_type,
            delta,
            online: false,
            archive_check: false,
            start_time: Some(at(time)),
            ..Default::default()
        },
        repo: repo.clone(),
        pg: Arc::new(LocalStorage::new(&data)),
        pg_path: data.clone(),
        standby_pg: None,
        primary: None,
        standby: None,
        stanza_info: StanzaInfo { version: PG_VERSION_95, system_id: SYSTEM_ID },
    };

    BackupController::new(make_context(BackupType::Full, false, "2019-10-02 17:10:31"))
        .run()
        .await
        .unwrap();

    let second = BackupController::new(make_context(
        BackupType::Incremental,
        true,
        "2019-10-03 17:10:31",
    ))
    .run()
    .await
    .unwrap();

    assert_eq!(second.stats.copied, 0);
    assert_eq!(second.stats.recopied, 0);
    assert_eq!(second.stats.noop, 2, "every file re-verified and unchanged");
    assert_eq!(second.manifest.repo_total_size(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 4: online 11 full with page checksums flags bad pages.
// ---------------------------------------------------------------------------
#[tokio::test]
async fn online_full_page_checksums() {
    let dir = TempDir::new().unwrap();
    let data = make_cluster(&dir, PG_VERSION_11, true);

    std::fs::create_dir_all(data.join("base/16384")).unwrap();

    let page = |block_no: u32, good: bool| -> Vec<u8> {
        let mut page = vec![0x42u8; PAGE_SIZE_DEFAULT];
        page[0..8].copy_from_slice(&1u64.to_le_bytes()); // LSN far below start
        page[14] = 0xFF; // pd_upper != 0
        let checksum = if good { checksum_page(&page, block_no) } else { 0xDEAD };
        page[8..10].copy_from_slice(&checksum.to_le_bytes());
        page
    };

    // One page, bad: flagged at page 0.
    std::fs::write(data.join("base/16384/100"), page(0, false)).unwrap();

    // Four pages: bad, good, bad, bad → [0, [2, 3]].
    let mut four = Vec::new();
    for (block_no, good) in [(0u32, false), (1, true), (2, false), (3, false)] {
        four.extend(page(block_no, good));
    }
    std::fs::write(data.join("base/16384/101"), four).unwrap();

    let result = BackupController::new(BackupContext {
        options: BackupOptions {
            stanza: "demo".into(),
            archive_check: false,
            start_time: Some(at("2019-10-02 17:10:31")),
            ..Default::default()
        },
        repo: Arc::new(LocalStorage::new(dir.path().join("repo"))),
        pg: Arc::new(LocalStorage::new(&data)),
        pg_path: data,
        standby_pg: None,
        primary: Some(Arc::new(ScriptedDb::new(online_script(110005, false)))),
        standby: None,
        stanza_info: StanzaInfo { version: PG_VERSION_11, system_id: SYSTEM_ID },
    })
    .run()
    .await
    .unwrap();

    let single = result.manifest.file("pg_data/base/16384/100").unwrap();
    assert_eq!(single.checksum_page, Some(false));
    assert_eq!(single.checksum_page_error.as_deref(), Some(&[PageRange::Single(0)][..]));

    let four = result.manifest.file("pg_data/base/16384/101").unwrap();
    assert_eq!(four.checksum_page, Some(false));
    assert_eq!(
        four.checksum_page_error.as_deref(),
        Some(&[PageRange::Single(0), PageRange::Range(2, 3)][..])
    );

    // Non-relation files carry no page verdict.
    let conf = result.manifest.file("pg_data/postgresql.conf").unwrap();
    assert_eq!(conf.checksum_page, None);

    // Non-exclusive stop synthesized backup_label into the backup.
    let label_file = result.manifest.file("pg_data/backup_label").unwrap();
    assert_eq!(label_file.timestamp, at("2019-10-02 17:12:00").timestamp());
    assert!(label_file.master);
}

// ---------------------------------------------------------------------------
// Scenario 5: online 9.6 backup-standby reads replicas from the standby.
// ---------------------------------------------------------------------------
#[tokio::test]
async fn online_backup_standby_reads_from_standby() {
    let dir = TempDir::new().unwrap();
    let data = make_cluster(&dir, PG_VERSION_96, false);

    // The same relation exists on both hosts; contents differ so the source
    // is provable.
    std::fs::create_dir_all(data.join("base/16384")).unwrap();
    std::fs::write(data.join("base/16384/200"), vec![0xAA; 512]).unwrap();

    let standby_data = dir.path().join("standby");
    std::fs::create_dir_all(standby_data.join("base/16384")).unwrap();
    std::fs::write(standby_data.join("base/16384/200"), vec![0xBB; 512]).unwrap();

    let standby_db = ScriptedDb::new(vec![
        (DbCall::IsStandby, DbAnswer::Bool(true)),
        // First poll lags the start LSN, second has replayed past it.
        (DbCall::ReplayLsn, DbAnswer::Lsn("0/27000000".parse().unwrap())),
        (DbCall::ReplayLsn, DbAnswer::Lsn("0/29000000".parse().unwrap())),
    ]);

    let repo = Arc::new(LocalStorage::new(dir.path().join("repo")));
    let result = BackupController::new(BackupContext {
        options: BackupOptions {
            stanza: "demo".into(),
            backup_standby: true,
            archive_check: false,
            start_time: Some(at("2019-10-02 17:10:31")),
            ..Default::default()
        },
        repo: repo.clone(),
        pg: Arc::new(LocalStorage::new(&data)),
        pg_path: data.clone(),
        standby_pg: Some(Arc::new(LocalStorage::new(&standby_data))),
        primary: Some(Arc::new(ScriptedDb::new(online_script(90605, false)))),
        standby: Some(Arc::new(standby_db)),
        stanza_info: StanzaInfo { version: PG_VERSION_96, system_id: SYSTEM_ID },
    })
    .run()
    .await
    .unwrap();

    // The relation (master=false) came from the standby; the config file
    // (master=true) from the primary.
    let backup_dir = format!("demo/backup/{}", result.label);
    assert_eq!(
        repo.read_all(&format!("{backup_dir}/pg_data/base/16384/200")).unwrap(),
        vec![0xBB; 512]
    );
    assert_eq!(
        repo.read_all(&format!("{backup_dir}/pg_data/postgresql.conf")).unwrap(),
        b"CONFIGSTUFF"
    );
}

// ---------------------------------------------------------------------------
// Scenario 6: archive check fails naming the withheld segment.
// ---------------------------------------------------------------------------
#[tokio::test]
async fn archive_timeout_names_segment() {
    let dir = TempDir::new().unwrap();
    let data = make_cluster(&dir, PG_VERSION_95, false);

    let repo = Arc::new(LocalStorage::new(dir.path().join("repo")));
    let layout = RepoLayout::new("demo");

    // Stop lands in the next segment; only the first is archived.
    let mut script = online_script(90510, true);
    script[6] = (
        DbCall::StopBackup { exclusive: true },
        DbAnswer::Stop(stop_result("0/29000040", "000000010000000000000029", true)),
    );

    repo.write_atomic(
        &format!(
            "{}/000000010000000000000028-0000000000000000000000000000000000000000",
            layout.archive_segment_dir("000000010000000000000028")
        ),
        b"wal",
    )
    .unwrap();

    let err = BackupController::new(BackupContext {
        options: BackupOptions {
            stanza: "demo".into(),
            archive_check: true,
            archive_timeout: Duration::from_millis(300),
            start_time: Some(at("2019-10-02 17:10:31")),
            ..Default::default()
        },
        repo: repo.clone(),
        pg: Arc::new(LocalStorage::new(&data)),
        pg_path: data,
        standby_pg: None,
        primary: Some(Arc::new(ScriptedDb::new(script))),
        standby: None,
        stanza_info: StanzaInfo { version: PG_VERSION_95, system_id: SYSTEM_ID },
    })
    .run()
    .await
    .unwrap_err();

    match err {
        Error::ArchiveTimeout { segment, timeout } => {
            assert_eq!(segment, "000000010000000000000029");
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("expected ArchiveTimeout, got {other:?}"),
    }

    // Post-StartBackup failure leaves a resumable partial, not a published
    // backup.
    assert!(repo.exists(&layout.partial_dir("20191002-171031F")).unwrap());
    assert!(!repo.exists(&layout.backup_dir("20191002-171031F")).unwrap());
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn seed_manifest(label: &str, backup_type: BackupType) -> Manifest {
    use pgvault_manifest::{
        BackupSection, DbSection, OptionSection, PathEntry, Target, TargetType,
    };
    use std::collections::BTreeMap;

    let mut manifest = Manifest::new(
        BackupSection {
            label: label.into(),
            prior: None,
            backup_type,
            timestamp_start: 1,
            timestamp_copy_start: 2,
            timestamp_stop: None,
            lsn_start: None,
            lsn_stop: None,
            archive_start: None,
            archive_stop: None,
            extra: BTreeMap::new(),
        },
        OptionSection::default(),
        DbSection {
            version: "9.5".into(),
            system_id: SYSTEM_ID,
            catalog_version: 201510051,
            extra: BTreeMap::new(),
        },
    );

    manifest
        .add_target(Target {
            name: "pg_data".into(),
            target_type: TargetType::Path,
            path: "/pg".into(),
            tablespace_id: None,
            tablespace_name: None,
            extra: BTreeMap::new(),
        })
        .unwrap();
    manifest
        .add_path(PathEntry {
            name: "pg_data".into(),
            mode: 0o750,
            user: None,
            group: None,
            extra: BTreeMap::new(),
        })
        .unwrap();

    manifest
}
