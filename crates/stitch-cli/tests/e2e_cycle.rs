//! E2E CLI tests: ingest, detect, verify, rebuild, and the read commands.
//!
//! Each test runs the `stitch` binary as a subprocess in an isolated temp
//! directory using the default config layout (`events/`, `.stitch/`).

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

fn stitch_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("stitch"));
    cmd.current_dir(dir);
    // Suppress tracing output that goes to stderr
    cmd.env("STITCH_LOG", "error");
    cmd
}

fn event_line(time: &str, ad: Option<i64>, session: &str, kind: i64) -> String {
    let ad = ad.map_or_else(|| "null".to_string(), |a| a.to_string());
    format!(
        r#"{{"event_time":"{time}","ad_id":{ad},"session_id":"{session}","viewer_id":"v1","event_type":{kind},"channel_id":7}}"#
    )
}

fn write_events(dir: &Path, name: &str, lines: &[String]) {
    let events = dir.join("events");
    fs::create_dir_all(&events).expect("create events dir");
    fs::write(events.join(name), lines.join("\n") + "\n").expect("write events file");
}

fn json_stdout(cmd: &mut Command) -> Value {
    let output = cmd.output().expect("command should not crash");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON on stdout")
}

fn scenario_project() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    write_events(
        dir.path(),
        "part-0001.jsonl",
        &[
            event_line("2024-02-15T10:00:10Z", Some(5), "S1", 1),
            event_line("2024-02-15T10:00:12Z", Some(5), "S1", 2),
        ],
    );
    dir
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[test]
fn ingest_twice_appends_once() {
    let dir = scenario_project();

    let first = json_stdout(stitch_cmd(dir.path()).args(["ingest", "--json"]));
    assert_eq!(first["files_new"], 1);
    assert_eq!(first["rows_appended"], 2);
    assert!(first["batch_id"].as_str().expect("batch id").starts_with("b-"));

    let second = json_stdout(stitch_cmd(dir.path()).args(["ingest", "--json"]));
    assert_eq!(second["files_new"], 0);
    assert_eq!(second["rows_appended"], 0);
    assert_eq!(second["files_seen"], 1);
}

#[test]
fn ingest_human_output_names_the_batch() {
    let dir = scenario_project();
    stitch_cmd(dir.path())
        .arg("ingest")
        .assert()
        .success()
        .stdout(predicate::str::contains("ingest: batch b-"))
        .stdout(predicate::str::contains("rows appended"));
}

#[test]
fn ingest_missing_source_reports_code() {
    let dir = TempDir::new().expect("tempdir");
    stitch_cmd(dir.path())
        .args(["ingest", "--source", "nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E3001"));
}

#[test]
fn ingest_malformed_file_commits_nothing() {
    let dir = TempDir::new().expect("tempdir");
    write_events(
        dir.path(),
        "bad.jsonl",
        &[event_line("2024-02-15T10:00:10Z", None, "S1", 1), "{oops".to_string()],
    );

    stitch_cmd(dir.path())
        .arg("ingest")
        .assert()
        .failure()
        .stderr(predicate::str::contains("E3002"));

    let files = json_stdout(stitch_cmd(dir.path()).args(["files", "--json"]));
    assert_eq!(files.as_array().expect("array").len(), 0);
}

// ---------------------------------------------------------------------------
// Detect
// ---------------------------------------------------------------------------

#[test]
fn detect_streams_scenario_flag_and_count_grows() {
    let dir = scenario_project();
    stitch_cmd(dir.path()).arg("ingest").assert().success();

    let output = stitch_cmd(dir.path())
        .args(["detect", "--now", "2024-02-15T10:00:13Z", "--json"])
        .output()
        .expect("detect runs");
    assert!(output.status.success());
    let lines: Vec<Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["session_id"], "S1");
    assert_eq!(lines[0]["ad_id"], 5);
    assert_eq!(lines[0]["fraudulent_click_count"], 1);

    write_events(
        dir.path(),
        "part-0002.jsonl",
        &[event_line("2024-02-15T10:00:13Z", Some(5), "S1", 2)],
    );
    stitch_cmd(dir.path()).arg("ingest").assert().success();

    let output = stitch_cmd(dir.path())
        .args(["detect", "--now", "2024-02-15T10:00:13Z", "--json"])
        .output()
        .expect("detect runs");
    let flag: Value = serde_json::from_str(
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .expect("one flag"),
    )
    .expect("json line");
    assert_eq!(flag["fraudulent_click_count"], 2);
}

#[test]
fn detect_outside_window_prints_nothing_flagged() {
    let dir = scenario_project();
    stitch_cmd(dir.path()).arg("ingest").assert().success();

    stitch_cmd(dir.path())
        .args(["detect", "--now", "2024-02-17T10:00:00Z"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no flagged sessions"));
}

#[test]
fn detect_with_custom_terminal_code_flags_nothing() {
    let dir = scenario_project();
    stitch_cmd(dir.path()).arg("ingest").assert().success();

    // With kind 1 as the terminal code the S1/ad 5 group is cleared.
    stitch_cmd(dir.path())
        .args(["detect", "--now", "2024-02-15T10:00:13Z", "--terminal", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no flagged sessions"));
}

// ---------------------------------------------------------------------------
// Verify / Rebuild
// ---------------------------------------------------------------------------

#[test]
fn verify_detects_drift_and_rebuild_repairs_it() {
    let dir = scenario_project();
    stitch_cmd(dir.path()).arg("ingest").assert().success();
    stitch_cmd(dir.path()).arg("verify").assert().success();

    let conn = rusqlite::Connection::open(dir.path().join(".stitch/stitch.db")).expect("open db");
    conn.execute(
        "UPDATE session_aggregates SET all_events = '[2]', event_count = 1",
        [],
    )
    .expect("damage cache");
    drop(conn);

    stitch_cmd(dir.path())
        .arg("verify")
        .assert()
        .failure()
        .stderr(predicate::str::contains("E4002"));

    let rebuilt = json_stdout(stitch_cmd(dir.path()).args(["rebuild", "--json"]));
    assert_eq!(rebuilt["groups"], 1);

    stitch_cmd(dir.path())
        .arg("verify")
        .assert()
        .success()
        .stdout(predicate::str::contains("consistent"));
}

// ---------------------------------------------------------------------------
// Read commands and reference data
// ---------------------------------------------------------------------------

#[test]
fn files_and_session_list_committed_state() {
    let dir = scenario_project();
    stitch_cmd(dir.path()).arg("ingest").assert().success();

    let files = json_stdout(stitch_cmd(dir.path()).args(["files", "--json"]));
    let files = files.as_array().expect("array");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["source_file_name"], "part-0001.jsonl");
    assert_eq!(files[0]["row_count"], 2);

    let session = json_stdout(stitch_cmd(dir.path()).args(["session", "S1", "--json"]));
    assert_eq!(session["groups"].as_array().expect("groups").len(), 1);

    stitch_cmd(dir.path())
        .args(["session", "nope"])
        .assert()
        .failure();
}

#[test]
fn reference_load_enriches_later_batches() {
    let dir = scenario_project();
    fs::write(
        dir.path().join("reference.json"),
        r#"{"ads":[{"ad_id":5,"campaign_id":50}],"campaigns":[{"campaign_id":50,"advertiser_id":500}],"channels":[{"channel_id":7,"content_distributor_id":70}]}"#,
    )
    .expect("write reference");

    let counts = json_stdout(
        stitch_cmd(dir.path()).args(["reference", "load", "reference.json", "--json"]),
    );
    assert_eq!(counts["ads"], 1);
    assert_eq!(counts["channels"], 1);

    let report = json_stdout(stitch_cmd(dir.path()).args(["ingest", "--json"]));
    assert_eq!(report["enrichment_misses"], 0);
}

#[test]
fn reference_load_without_file_fails() {
    let dir = TempDir::new().expect("tempdir");
    stitch_cmd(dir.path())
        .args(["reference", "load"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E3003"));
}

#[test]
fn config_file_overrides_store_and_source() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(
        dir.path().join("stitch.toml"),
        "[store]\npath = \"data/clicks.db\"\n\n[source]\ndir = \"incoming\"\n",
    )
    .expect("write config");
    let incoming = dir.path().join("incoming");
    fs::create_dir_all(&incoming).expect("mkdir");
    fs::write(
        incoming.join("a.jsonl"),
        event_line("2024-02-15T10:00:10Z", None, "S1", 1) + "\n",
    )
    .expect("write events");

    let report = json_stdout(stitch_cmd(dir.path()).args(["ingest", "--json"]));
    assert_eq!(report["rows_appended"], 1);
    assert!(dir.path().join("data/clicks.db").exists());
}

#[test]
fn invalid_config_is_reported() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(dir.path().join("stitch.toml"), "[fraud\nwindow_secs = 1\n").expect("write");
    stitch_cmd(dir.path())
        .arg("files")
        .assert()
        .failure()
        .stderr(predicate::str::contains("E1001"));
}

#[test]
fn verbose_flag_enables_debug_logs_on_stderr() {
    let dir = TempDir::new().expect("tempdir");

    let mut quiet = stitch_cmd(dir.path());
    quiet.env_remove("STITCH_LOG").env_remove("DEBUG").arg("files");
    quiet
        .assert()
        .success()
        .stderr(predicate::str::contains("starting").not());

    let mut verbose = stitch_cmd(dir.path());
    verbose.env_remove("STITCH_LOG").env_remove("DEBUG").args(["files", "-v"]);
    verbose
        .assert()
        .success()
        .stderr(predicate::str::contains("starting"));
}

#[test]
fn completions_generate_for_bash() {
    let dir = TempDir::new().expect("tempdir");
    stitch_cmd(dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stitch"));
}
