//! End-to-end tests for the ezpump binary
//!
//! These tests run the binary in a scratch directory and cover:
//! - Store creation and source import
//! - Status output
//! - Resumable K10plus import
//! - Destination preparation against a mocked target system
//! - Error handling for missing stores and credentials

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

const RECORDS: &str = "\u{1d}\n\
    \u{1e}003@ \u{1f}0100\n\
    \u{1e}021A \u{1f}aErster Titel\n\
    \u{1d}\n\
    \u{1e}003@ \u{1f}0200\n\
    \u{1e}021A \u{1f}aZweiter Titel\n";

/// Binary running in `work` with a clean job environment
fn ezpump(work: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ezpump").unwrap();
    cmd.current_dir(work.path())
        .env("NO_COLOR", "1")
        .env("EZPUMP_SOURCE_DB", work.path().join("source.sqlite"))
        .env("EZPUMP_DESTINATION_DIR", work.path().join("destination"))
        .env_remove("EZPUMP_EASYDB_URL")
        .env_remove("EZPUMP_EASYDB_LOGIN")
        .env_remove("EZPUMP_EASYDB_PASSWORD")
        .env_remove("EZPUMP_EAS_URL")
        .env_remove("LOG_LEVEL");
    cmd
}

// ============================================================================
// Store and Import Tests
// ============================================================================

#[test]
fn test_init_import_and_status() {
    let work = TempDir::new().unwrap();
    std::fs::write(work.path().join("bilder.csv"), "id;titel\n1;Hafen\n2;Markt\n").unwrap();

    ezpump(&work)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Intermediate store ready"));
    assert!(work.path().join("source.sqlite").exists());

    ezpump(&work)
        .args(["import", "csv", "bilder.csv", "--name", "fotos", "--delimiter", ";"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported source 'fotos'"))
        .stdout(predicate::str::contains("2 rows"));

    ezpump(&work)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("fotos"))
        .stdout(predicate::str::contains("Not prepared"));

    ezpump(&work)
        .args(["remove-source", "fotos"])
        .assert()
        .success();
    ezpump(&work)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sources:   none"));
}

#[test]
fn test_import_without_store_fails() {
    let work = TempDir::new().unwrap();
    std::fs::write(work.path().join("bilder.csv"), "id,titel\n1,Hafen\n").unwrap();

    ezpump(&work)
        .args(["import", "csv", "bilder.csv", "--name", "fotos"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ezpump init"));
}

#[test]
fn test_unknown_init_mode_fails() {
    let work = TempDir::new().unwrap();
    ezpump(&work)
        .args(["init", "--mode", "sometimes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown init mode"));
}

// ============================================================================
// K10plus Tests
// ============================================================================

#[test]
fn test_k10plus_import_resumes() {
    let work = TempDir::new().unwrap();
    std::fs::write(work.path().join("titel.pp"), RECORDS).unwrap();
    ezpump(&work).arg("init").assert().success();

    ezpump(&work)
        .args(["k10plus", "titel.pp"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 items, 4 rows (0 already imported)"));

    // Everything is committed; a second run only skips
    ezpump(&work)
        .args(["k10plus", "titel.pp"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 items, 0 rows (2 already imported)"));
}

#[test]
fn test_k10plus_missing_file_fails() {
    let work = TempDir::new().unwrap();
    ezpump(&work).arg("init").assert().success();
    ezpump(&work)
        .args(["k10plus", "missing.pp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

// ============================================================================
// Remote Tests
// ============================================================================

#[test]
fn test_load_requires_credentials() {
    let work = TempDir::new().unwrap();
    ezpump(&work).arg("init").assert().success();
    ezpump(&work)
        .arg("prepare")
        .assert()
        .failure()
        .stderr(predicate::str::contains("EZPUMP_EASYDB_LOGIN"));
}

#[tokio::test]
async fn test_prepare_creates_destination() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t0"})))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/session/authenticate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t1"})))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/schema/user/CURRENT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "user",
            "version": 2,
            "tables": [{
                "name": "bilder",
                "pool_link": true,
                "columns": [{"kind": "column", "name": "titel", "type": "text_oneline"}]
            }]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/config/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "system": [
                {"name": "languages", "parameters": {"database": {"choices": ["de-DE"]}}}
            ]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let work = TempDir::new().unwrap();
    ezpump(&work).arg("init").assert().success();

    let remote = |cmd: &mut Command| {
        cmd.env("EZPUMP_EASYDB_URL", mock_server.uri())
            .env("EZPUMP_EASYDB_LOGIN", "root")
            .env("EZPUMP_EASYDB_PASSWORD", "secret");
    };

    let mut prepare = ezpump(&work);
    remote(&mut prepare);
    prepare
        .arg("prepare")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 object types"))
        .stdout(predicate::str::contains("de-DE"));

    // Cached schema and existing store: nothing is fetched again
    let mut again = ezpump(&work);
    remote(&mut again);
    again.arg("prepare").assert().success();

    ezpump(&work)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("destination.db"))
        .stdout(predicate::str::contains("Languages: de-DE"));
}
