mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn catalog() -> Command {
    let mut cmd = Command::cargo_bin("mcp-catalog").unwrap();
    cmd.env_remove("MCP_CATALOG_SERVERS")
        .env_remove("RUST_LOG")
        .env("MCP_CATALOG_LOG_LEVEL", "warn");
    cmd
}

#[test]
fn test_binary_help() {
    catalog()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("discover"))
        .stdout(predicate::str::contains("--servers"));
}

#[test]
fn test_missing_descriptor_path_fails() {
    catalog()
        .arg("discover")
        .assert()
        .failure()
        .stderr(predicate::str::contains("MCP_CATALOG_SERVERS"));
}

#[test]
fn test_check_reports_missing_env() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    // Desktop layout with a trailing comma, as pasted from a client config.
    write!(
        file,
        r#"{{"mcpServers": {{"search": {{"command": "search-server", "env": {{"MCP_CATALOG_TEST_UNSET_KEY": "${{MCP_CATALOG_TEST_UNSET_KEY}}"}},}}}}}}"#
    )
    .unwrap();

    catalog()
        .env_remove("MCP_CATALOG_TEST_UNSET_KEY")
        .arg("--servers")
        .arg(file.path())
        .arg("check")
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"ready\": false"))
        .stdout(predicate::str::contains("MCP_CATALOG_TEST_UNSET_KEY"));
}

#[test]
fn test_bad_descriptor_file_reports_location() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    writeln!(file, "{{\n  \"servers\": {{\n    \"x\": [1 2]\n  }}\n}}").unwrap();

    catalog()
        .arg("--servers")
        .arg(file.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 3"));
}

#[cfg(unix)]
mod with_stub_server {
    use super::*;

    fn descriptors(dir: &std::path::Path) -> std::path::PathBuf {
        let script = super::common::write_stub_server(dir);
        let path = dir.join("servers.yaml");
        std::fs::write(
            &path,
            format!(
                "servers:\n  stub:\n    command: sh\n    args: [\"{}\"]\n",
                script.display()
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_discover_prints_report() {
        let dir = tempfile::tempdir().unwrap();
        let servers = descriptors(dir.path());

        catalog()
            .arg("--servers")
            .arg(&servers)
            .arg("discover")
            .assert()
            .success()
            .stdout(predicate::str::contains("stub__echo"))
            .stdout(predicate::str::contains("\"status\": \"discovered\""));
    }

    #[test]
    fn test_call_prints_result() {
        let dir = tempfile::tempdir().unwrap();
        let servers = descriptors(dir.path());

        catalog()
            .arg("--servers")
            .arg(&servers)
            .arg("--lifecycle")
            .arg("stop_after_discovery")
            .args(["call", "stub__echo", "--args", r#"{"x": 1}"#])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"x\": 1"));
    }

    #[test]
    fn test_call_unknown_tool_prints_structured_error() {
        let dir = tempfile::tempdir().unwrap();
        let servers = descriptors(dir.path());

        catalog()
            .arg("--servers")
            .arg(&servers)
            .args(["call", "stub__nope"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("\"kind\": \"tool_not_found\""));
    }
}
