//! Integration tests for the autoctf CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// autoctf command isolated from the caller's environment and working dir.
fn autoctf(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("autoctf");
    cmd.current_dir(dir.path()).env_clear().env("RUST_LOG", "off");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        autoctf(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("validate"))
            .stdout(predicate::str::contains("targets"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        autoctf(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_run_requires_an_address() {
        let dir = TempDir::new().unwrap();
        autoctf(&dir).arg("run").assert().failure();
    }
}

mod validation {
    use super::*;

    #[test]
    fn test_validate_without_credentials_fails_naming_them() {
        let dir = TempDir::new().unwrap();
        autoctf(&dir)
            .arg("validate")
            .assert()
            .failure()
            .stdout(predicate::str::contains("E2B_API_KEY"))
            .stdout(predicate::str::contains("XAI_API_KEY"));
    }

    #[test]
    fn test_validate_json_report() {
        let dir = TempDir::new().unwrap();
        let output = autoctf(&dir).args(["validate", "--json"]).output().unwrap();
        assert!(!output.status.success());
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["valid"], false);
        assert!(report["warnings"].as_array().unwrap().iter().any(|w| {
            w.as_str().unwrap().starts_with("publish:")
        }));
    }

    #[test]
    fn test_placeholder_token_is_reported_as_error() {
        let dir = TempDir::new().unwrap();
        autoctf(&dir)
            .arg("validate")
            .env("E2B_API_KEY", "your_e2b_api_key_here")
            .assert()
            .failure()
            .stdout(predicate::str::contains("placeholder"));
    }
}

mod targets {
    use super::*;

    #[test]
    fn test_add_list_and_archive_target() {
        let dir = TempDir::new().unwrap();
        autoctf(&dir)
            .args(["targets", "add", "--url", "http://dvwa.local"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created target 1 (dvwa.local)"));

        autoctf(&dir)
            .args(["targets", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("dvwa.local"))
            .stdout(predicate::str::contains("active"));

        autoctf(&dir).args(["targets", "archive", "1"]).assert().success();
        autoctf(&dir)
            .args(["targets", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("archived"));
    }

    #[test]
    fn test_add_rejects_non_http_url() {
        let dir = TempDir::new().unwrap();
        autoctf(&dir)
            .args(["targets", "add", "--url", "ftp://files.local"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("http://"));
    }

    #[test]
    fn test_status_of_unknown_run() {
        let dir = TempDir::new().unwrap();
        autoctf(&dir)
            .args(["status", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Run 42 not found"));
    }

    #[test]
    fn test_config_file_moves_database() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("custom.toml"), "[database]\npath = \"data/custom.db\"\n").unwrap();
        autoctf(&dir)
            .args(["--config", "custom.toml", "targets", "add", "--repo", "https://github.com/acme/webapp"])
            .assert()
            .success();
        assert!(dir.path().join("data/custom.db").exists());
    }
}
