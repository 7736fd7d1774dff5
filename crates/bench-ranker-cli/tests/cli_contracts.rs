#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use bench_ranker_core::TestCatalog;
use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn ranker_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_ranker") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/ranker");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "bench-ranker-cli", "--bin", "ranker"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build ranker binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("bench-ranker-cli-{}.sqlite3", Ulid::new()))
}

fn ranker_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(ranker_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run ranker command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

/// The envelope is the last stderr line; log lines precede it.
fn stderr_envelope(output: &Output) -> Value {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let last = match stderr.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(line) => line.to_string(),
        None => panic!("expected an error envelope on stderr"),
    };
    match serde_json::from_str::<Value>(&last) {
        Ok(value) => value,
        Err(err) => panic!("failed to parse error envelope: {err}\nstderr={stderr}"),
    }
}

fn succeed(db_path: &Path, args: &[&str]) -> Value {
    let output = ranker_output(db_path, args);
    assert!(
        output.status.success(),
        "command {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_name);
    let schema = read_json(&schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

/// Builds a complete `results` argument for the built-in reflow suite.
fn reflow_results(score: i64) -> String {
    let catalog = TestCatalog::builtin();
    let test_set = match catalog.test_set("reflow") {
        Some(test_set) => test_set,
        None => panic!("built-in catalog lost the reflow category"),
    };
    test_set
        .test_keys()
        .iter()
        .map(|key| format!("{key}={score}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn first_reflow_test() -> String {
    match TestCatalog::builtin()
        .test_set("reflow")
        .and_then(|test_set| test_set.test_keys().into_iter().next())
    {
        Some(key) => key,
        None => panic!("built-in reflow suite has no tests"),
    }
}

fn add_results(db_path: &Path, browser: &str, score: i64) -> Value {
    let results = reflow_results(score);
    succeed(
        db_path,
        &[
            "results",
            "add",
            "--category",
            "reflow",
            "--browser",
            browser,
            "--results",
            &results,
        ],
    )
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(ranker_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["rebuild", "publish", "results", "live", "ranker", "status"] {
        assert!(
            stdout.contains(required),
            "help output missing subcommand `{required}`:\n{stdout}"
        );
    }
}

#[test]
fn live_drain_feeds_current_rankers() {
    let db = temp_db();
    let added = add_results(&db, "Firefox 3.5", 1200);
    assert_eq!(added["category"], serde_json::json!("reflow"));
    assert!(added["created_at"].as_str().is_some_and(|at| at.ends_with('Z')));

    let drained = succeed(&db, &["live", "drain"]);
    assert_eq!(drained["applied_groups"], serde_json::json!(1));
    assert_eq!(drained["deferred"], serde_json::json!(false));

    let test_key = first_reflow_test();
    for browser in ["Firefox", "Firefox 3", "Firefox 3.5"] {
        let summary = succeed(
            &db,
            &[
                "ranker",
                "show",
                "--category",
                "reflow",
                "--test",
                &test_key,
                "--browser",
                browser,
            ],
        );
        assert_schema("ranker-summary.schema.json", &summary);
        assert_eq!(summary["total_ranked_scores"], serde_json::json!(1));
        assert_eq!(summary["median"], serde_json::json!(1200));
    }

    let status = succeed(&db, &["status"]);
    assert_eq!(status["dirty_scores"], serde_json::json!(0));
    assert_eq!(status["result_groups"], serde_json::json!(1));
    let _ = fs::remove_file(&db);
}

#[test]
fn chunked_rebuild_then_publish_swaps_versions() {
    let db = temp_db();
    add_results(&db, "IE 8", 300);
    add_results(&db, "Safari 4", 500);
    succeed(&db, &["live", "drain"]);

    let first = succeed(&db, &["rebuild", "chunk", "--fetch-limit", "1"]);
    assert_schema("rebuild-chunk.schema.json", &first);
    assert_eq!(first["is_done"], serde_json::json!(false));
    assert_eq!(first["total_results"], serde_json::json!(1));
    let bookmark = match first["bookmark"].as_str() {
        Some(value) if !value.is_empty() => value.to_string(),
        other => panic!("expected a resume bookmark, got {other:?}"),
    };

    let status = succeed(&db, &["status"]);
    assert_eq!(status["paused"], serde_json::json!(true));

    let finished = succeed(
        &db,
        &[
            "rebuild",
            "run",
            "--fetch-limit",
            "1",
            "--bookmark",
            &bookmark,
            "--total-results",
            "1",
        ],
    );
    assert_schema("rebuild-chunk.schema.json", &finished);
    assert_eq!(finished["is_done"], serde_json::json!(true));
    assert_eq!(finished["total_results"], serde_json::json!(2));

    let test_key = first_reflow_test();
    let next = succeed(
        &db,
        &[
            "ranker",
            "show",
            "--category",
            "reflow",
            "--test",
            &test_key,
            "--browser",
            "Safari",
            "--ranker-version",
            "next",
        ],
    );
    assert_eq!(next["total_ranked_scores"], serde_json::json!(1));

    let published = succeed(&db, &["publish", "chunk", "--fetch-limit", "1000"]);
    assert_schema("publish-chunk.schema.json", &published);
    assert_eq!(published["is_done"], serde_json::json!(true));
    assert!(published["total"].as_u64().is_some_and(|total| total > 0));

    let status = succeed(&db, &["status"]);
    assert_eq!(status["paused"], serde_json::json!(false));
    assert_eq!(status["next_rankers"], serde_json::json!(0));
    assert!(status["migration_completed_at"].is_string());

    let repeat = succeed(&db, &["publish", "run"]);
    assert_schema("publish-chunk.schema.json", &repeat);
    assert_eq!(repeat["total"], serde_json::json!(0));
    let _ = fs::remove_file(&db);
}

#[test]
fn malformed_results_key_emits_error_envelope() {
    let db = temp_db();
    let output = ranker_output(
        &db,
        &[
            "results",
            "add",
            "--category",
            "reflow",
            "--browser",
            "IE 8",
            "--results",
            "notATest=12",
        ],
    );
    assert!(!output.status.success());

    let envelope = stderr_envelope(&output);
    assert_schema("error-envelope.schema.json", &envelope);
    assert_eq!(
        envelope["code"],
        serde_json::json!("ranker.malformed_results_key")
    );
    assert_eq!(envelope["retry"], serde_json::json!(false));
    let _ = fs::remove_file(&db);
}

#[test]
fn zero_deadline_is_rejected_as_configuration() {
    let db = temp_db();
    let output = ranker_output(&db, &["rebuild", "chunk", "--deadline-ms", "0"]);
    assert!(!output.status.success());

    let envelope = stderr_envelope(&output);
    assert_schema("error-envelope.schema.json", &envelope);
    assert_eq!(envelope["code"], serde_json::json!("ranker.configuration"));
    let _ = fs::remove_file(&db);
}
