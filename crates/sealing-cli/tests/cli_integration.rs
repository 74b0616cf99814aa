use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use sealing_core::{
    CaseFile, CaseId, CriminalRecordDetail, RecordId, SubstanceRecordDetail,
    SupervisionRecordDetail, TriState,
};
use sealing_store_sqlite::SqliteStore;
use serde_json::Value;
use time::macros::date;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn case_id(raw: &str) -> CaseId {
    CaseId::parse(raw).unwrap_or_else(|err| panic!("invalid fixture case id: {err}"))
}

fn seeded_db(dir: &Path) -> PathBuf {
    let db_path = dir.join("sealing.sqlite3");
    let mut store = SqliteStore::open(&db_path)
        .unwrap_or_else(|err| panic!("failed to open fixture store: {err}"));
    store.migrate().unwrap_or_else(|err| panic!("failed to migrate fixture store: {err}"));
    store
        .put_case(&CaseFile {
            case_id: case_id("2015-JV-0042"),
            birth_date: Some(date!(2001 - 03 - 10)),
            sealed: TriState::False,
        })
        .unwrap_or_else(|err| panic!("failed to seed case: {err}"));
    for (id, record_date) in [(3, date!(2019 - 03 - 10)), (1, date!(2015 - 05 - 01))] {
        store
            .insert_criminal_record(&CriminalRecordDetail {
                id: RecordId(id),
                case_id: case_id("2015-JV-0042"),
                record_date,
                branch_name: Some("Central".to_string()),
                crime_name: Some(format!("charge {id}")),
                sentence_type: None,
                memo: None,
            })
            .unwrap_or_else(|err| panic!("failed to seed criminal record: {err}"));
    }
    store
        .insert_supervision_record(&SupervisionRecordDetail {
            id: RecordId(10),
            case_id: case_id("2015-JV-0042"),
            notice_date: date!(2016 - 01 - 05),
            close_date: Some(date!(2017 - 01 - 05)),
            closed: true,
            branch_name: None,
            source_text: None,
            archive_name: None,
        })
        .unwrap_or_else(|err| panic!("failed to seed supervision record: {err}"));
    store
        .insert_substance_record(&SubstanceRecordDetail {
            id: RecordId(20),
            case_id: case_id("2015-JV-0042"),
            created_date: date!(2022 - 07 - 01),
            branch_name: None,
            substance_summary: None,
            referral_text: None,
        })
        .unwrap_or_else(|err| panic!("failed to seed substance record: {err}"));
    db_path
}

fn run_sealctl<I, S>(db_path: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_sealctl"))
        .arg("--db")
        .arg(db_path)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute sealctl binary: {err}"))
}

fn run_json<I, S>(db_path: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_sealctl(db_path, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "sealctl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_failure<I, S>(db_path: &Path, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_sealctl(db_path, args);
    assert!(!output.status.success(), "sealctl unexpectedly succeeded");
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn seal_args(command: &str) -> Vec<&str> {
    vec![
        command,
        "--case-id",
        "2015-JV-0042",
        "--reason",
        "statutory sealing",
        "--document-number",
        "88",
        "--actor-id",
        "officer-3",
    ]
}

#[test]
fn db_commands_report_schema_and_migrate() {
    let dir = unique_temp_dir("sealctl-db");
    let db_path = dir.join("fresh.sqlite3");

    let status = run_json(&db_path, ["db", "schema-version"]);
    assert_eq!(as_str(&status, "contract_version"), "cli.v1");
    assert_eq!(status.get("current_version").and_then(Value::as_i64), Some(0));
    assert_eq!(status.get("up_to_date").and_then(Value::as_bool), Some(false));

    let plan = run_json(&db_path, ["db", "migrate", "--dry-run"]);
    assert_eq!(plan.get("would_apply_versions"), Some(&serde_json::json!([1, 2])));

    let applied = run_json(&db_path, ["db", "migrate"]);
    assert_eq!(applied.get("after_version").and_then(Value::as_i64), Some(2));

    let integrity = run_json(&db_path, ["db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok").and_then(Value::as_bool), Some(true));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn case_commands_report_eligibility_and_juvenile_records() {
    let dir = unique_temp_dir("sealctl-case");
    let db_path = seeded_db(&dir);

    let eligibility = run_json(
        &db_path,
        ["case", "eligibility", "--case-id", "2015-JV-0042", "--as-of", "2024-01-01"],
    );
    assert_eq!(as_str(&eligibility, "is_over_18"), "true");
    assert_eq!(as_str(&eligibility, "is_latest_supervision_closed"), "true");
    assert_eq!(eligibility.get("eligible").and_then(Value::as_bool), Some(true));

    let minor = run_json(
        &db_path,
        ["case", "eligibility", "--case-id", "2015-JV-0042", "--as-of", "2019-03-09"],
    );
    assert_eq!(minor.get("eligible").and_then(Value::as_bool), Some(false));

    let records = run_json(
        &db_path,
        ["case", "records", "--case-id", "2015-JV-0042", "--before-eighteen-only"],
    );
    assert_eq!(records.get("criminal_ids"), Some(&serde_json::json!([1])));
    assert_eq!(records.get("supervision_ids"), Some(&serde_json::json!([10])));
    assert_eq!(records.get("substance_ids"), Some(&serde_json::json!([20])));

    let review = run_json(&db_path, ["case", "review", "--case-id", "2015-JV-0042"]);
    assert_eq!(as_str(&review, "eighteenth_birthday"), "2019-03-10");
    assert_eq!(review.get("criminal").and_then(Value::as_array).map(Vec::len), Some(1));

    let stderr = run_failure(&db_path, ["case", "eligibility", "--case-id", "missing"]);
    assert!(stderr.contains("not_found"), "stderr: {stderr}");

    let stderr = run_failure(
        &db_path,
        [
            "case",
            "records",
            "--case-id",
            "2015-JV-0042",
            "--start",
            "2020-01-01",
            "--end",
            "2019-01-01",
        ],
    );
    assert!(stderr.contains("validation_error"), "stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn records_hydrate_preserves_requested_order() {
    let dir = unique_temp_dir("sealctl-hydrate");
    let db_path = seeded_db(&dir);

    let hydrated =
        run_json(&db_path, ["records", "hydrate", "--category", "criminal", "--ids", "3,404,1"]);
    assert_eq!(as_str(&hydrated, "category"), "criminal");
    let ids = hydrated
        .get("records")
        .and_then(Value::as_array)
        .map(|records| {
            records.iter().filter_map(|record| record.get("id").and_then(Value::as_i64)).collect()
        })
        .unwrap_or_else(Vec::new);
    assert_eq!(ids, vec![3, 1]);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn seal_restore_round_trip_is_audited_and_verifiable() {
    let dir = unique_temp_dir("sealctl-seal");
    let db_path = seeded_db(&dir);

    let sealed = run_json(&db_path, seal_args("seal"));
    assert_eq!(as_str(&sealed, "action"), "seal");
    assert_eq!(sealed.get("sequence").and_then(Value::as_u64), Some(1));
    assert_eq!(sealed.pointer("/snapshot/criminal_ids"), Some(&serde_json::json!([1, 3])));

    let stderr = run_failure(&db_path, seal_args("seal"));
    assert!(stderr.contains("already_erased"), "stderr: {stderr}");

    let restored = run_json(&db_path, seal_args("restore"));
    assert_eq!(as_str(&restored, "action"), "restore");
    assert_eq!(as_str(&restored, "prev_hash"), as_str(&sealed, "entry_hash"));

    let stderr = run_failure(&db_path, seal_args("restore"));
    assert!(stderr.contains("not_erased"), "stderr: {stderr}");

    let listed = run_json(&db_path, ["audit", "list", "--case-id", "2015-JV-0042"]);
    let actions = listed
        .get("entries")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("action").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(Vec::new);
    assert_eq!(actions, vec!["restore".to_string(), "seal".to_string()]);

    let verified = run_json(&db_path, ["audit", "verify"]);
    assert_eq!(verified.get("ok").and_then(Value::as_bool), Some(true));
    assert_eq!(verified.get("entries").and_then(Value::as_u64), Some(2));

    let out_dir = dir.join("export");
    let exported = run_json(&db_path, ["db", "export-ledger", "--out", path_str(&out_dir)]);
    assert_eq!(exported.pointer("/manifest/files/0/records").and_then(Value::as_u64), Some(2));
    assert!(out_dir.join("manifest.json").exists());
    assert!(out_dir.join("seal_audit.ndjson").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn seal_rejects_blank_reason_without_writing_audit() {
    let dir = unique_temp_dir("sealctl-invalid");
    let db_path = seeded_db(&dir);

    let stderr = run_failure(
        &db_path,
        [
            "seal",
            "--case-id",
            "2015-JV-0042",
            "--reason",
            "   ",
            "--document-number",
            "88",
            "--actor-id",
            "officer-3",
        ],
    );
    assert!(stderr.contains("validation_error"), "stderr: {stderr}");

    let output = Command::new(env!("CARGO_BIN_EXE_sealctl"))
        .args(["audit", "list"])
        .env("SEALING_DB", &db_path)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute sealctl binary: {err}"));
    assert!(output.status.success());
    let listed: Value = serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}"));
    assert_eq!(listed.get("entries").and_then(Value::as_array).map(Vec::len), Some(0));

    let _ = fs::remove_dir_all(&dir);
}
