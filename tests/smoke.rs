//! Smoke tests -- verify the binary runs and the job pipeline works end to end.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_cli_help() {
    Command::cargo_bin("streamwarden")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Streaming anomaly detection"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("streamwarden")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("streamwarden"));
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("streamwarden")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--restore"));
}

#[test]
fn test_default_config_parses() {
    let output = Command::cargo_bin("streamwarden")
        .unwrap()
        .arg("default-config")
        .assert()
        .success()
        .stdout(predicates::str::contains("[bucket]"))
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    let config = streamwarden::config::EngineConfig::from_toml(&text).unwrap();
    assert_eq!(config.bucket.length_secs, 300);
}

#[test]
fn test_run_writes_results_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let config = dir.path().join("streamwarden.toml");
    std::fs::write(
        &config,
        "[bucket]\nlength_secs = 100\n\n[[detectors]]\nfunction = \"count\"\npartition_field = \"host\"\n",
    )
    .unwrap();

    let input = "{\"_time\": 100, \"host\": \"a\"}\n\
                 {\"_time\": 150, \"host\": \"b\"}\n\
                 {\"_time\": 250, \"host\": \"a\"}\n\
                 {\".\": \"f1\"}\n";

    Command::cargo_bin("streamwarden")
        .unwrap()
        .args(["run", "--config"])
        .arg(&config)
        .arg("--state-db")
        .arg(&db)
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicates::str::contains("\"type\":\"bucket\""))
        .stdout(predicates::str::contains("\"type\":\"flush_ack\""))
        .stdout(predicates::str::contains("\"records_handled\":3"))
        .stdout(predicates::str::contains("\"type\":\"persisted\""));

    Command::cargo_bin("streamwarden")
        .unwrap()
        .args(["snapshots", "--config"])
        .arg(&config)
        .arg("--state-db")
        .arg(&db)
        .assert()
        .success()
        .stdout(predicates::str::contains("final").and(predicates::str::contains("Entities")));

    // A restored job picks up where the last one stopped: records from
    // before the last finalised bucket are now out of order.
    Command::cargo_bin("streamwarden")
        .unwrap()
        .args(["run", "--restore", "--config"])
        .arg(&config)
        .arg("--state-db")
        .arg(&db)
        .write_stdin("{\"_time\": 120, \"host\": \"a\"}\n{\".\": \"f2\"}\n")
        .assert()
        .success()
        .stdout(predicates::str::contains("\"records_handled\":0"));
}
