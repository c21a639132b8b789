//! CLI integration tests.
//!
//! These tests run the built binary against a temporary home directory.

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn mcpauth(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mcpauth"));
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("XDG_DATA_HOME", home.join(".local/share"))
        .env("XDG_STATE_HOME", home.join(".local/state"))
        .env_remove("MCPAUTH_DATA_DIR")
        .env_remove("MCPAUTH_CALLBACK_PORT")
        .env_remove("RUST_LOG");
    cmd
}

fn run(home: &Path, args: &[&str]) -> Output {
    mcpauth(home)
        .args(args)
        .output()
        .expect("Failed to execute command")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn identity_of(home: &Path, url: &str) -> String {
    let output = run(home, &["identity", url]);
    assert!(output.status.success());
    stdout(&output).trim().to_string()
}

#[test]
fn test_version_command() {
    let home = TempDir::new().unwrap();
    let output = run(home.path(), &["version"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("mcpauth"));
}

#[test]
fn test_help_command() {
    let home = TempDir::new().unwrap();
    let output = run(home.path(), &["--help"]);

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("OAuth sign-in for remote MCP servers"));
    assert!(out.contains("login"));
    assert!(out.contains("logout"));
}

#[test]
fn test_identity_is_stable_hex() {
    let home = TempDir::new().unwrap();
    let first = identity_of(home.path(), "https://mcp.example.com/sse");
    let second = identity_of(home.path(), "https://mcp.example.com/sse");
    let other = identity_of(home.path(), "https://mcp.example.com/other");

    assert_eq!(first.len(), 32);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    assert_eq!(first, second);
    assert_ne!(first, other);
}

#[test]
fn test_identity_paths_use_data_dir() {
    let home = TempDir::new().unwrap();
    let store = home.path().join("store");
    let url = "https://mcp.example.com/sse";
    let id = identity_of(home.path(), url);

    let output = run(
        home.path(),
        &["identity", url, "--paths", "--data-dir", store.to_str().unwrap()],
    );
    assert!(output.status.success());

    let out = stdout(&output);
    let expected = store.join(format!("{id}_tokens.json"));
    assert!(out.contains(expected.to_str().unwrap()));
    assert!(out.contains(&format!("{id}_client_info.json")));
    assert!(out.contains(&format!("{id}_code_verifier.txt")));
    assert!(out.contains(&format!("{id}_lock.json")));
}

#[test]
fn test_status_without_credentials() {
    let home = TempDir::new().unwrap();
    let store = home.path().join("store");
    let output = run(
        home.path(),
        &["status", "https://mcp.example.com/sse", "--data-dir", store.to_str().unwrap()],
    );

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("not signed in"));
    assert!(out.contains("not registered"));
}

#[test]
fn test_status_and_logout_with_stored_tokens() {
    let home = TempDir::new().unwrap();
    let store = home.path().join("store");
    std::fs::create_dir_all(&store).unwrap();
    let url = "https://mcp.example.com/sse";
    let id = identity_of(home.path(), url);

    std::fs::write(
        store.join(format!("{id}_tokens.json")),
        r#"{"access_token": "secret-access", "token_type": "Bearer", "refresh_token": "secret-refresh"}"#,
    )
    .unwrap();
    std::fs::write(
        store.join(format!("{id}_client_info.json")),
        r#"{"client_id": "client-abc"}"#,
    )
    .unwrap();

    let data_dir = store.to_str().unwrap();
    let output = run(home.path(), &["status", url, "--json", "--data-dir", data_dir]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(!out.contains("secret-access"));

    let report: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(report["identity"], id.as_str());
    assert_eq!(report["client_id"], "client-abc");
    assert_eq!(report["signed_in"], true);
    assert_eq!(report["token_valid"], true);
    assert_eq!(report["has_refresh_token"], true);

    let output = run(home.path(), &["logout", url, "--data-dir", data_dir]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Signed out"));
    assert!(!store.join(format!("{id}_tokens.json")).exists());
    assert!(!store.join(format!("{id}_client_info.json")).exists());
}

#[test]
fn test_data_dir_from_environment() {
    let home = TempDir::new().unwrap();
    let store = home.path().join("env-store");
    let url = "https://mcp.example.com/sse";

    let output = mcpauth(home.path())
        .env("MCPAUTH_DATA_DIR", &store)
        .args(["status", url, "--json"])
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["store"], store.to_str().unwrap());
}

#[test]
fn test_invalid_config_file_fails() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("config.json");
    std::fs::write(&config, "{ not json").unwrap();

    let output = run(
        home.path(),
        &["status", "https://mcp.example.com", "--config", config.to_str().unwrap()],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid config file"));
}

#[test]
fn test_login_rejects_invalid_url() {
    let home = TempDir::new().unwrap();
    let store = home.path().join("store");
    let output = run(
        home.path(),
        &["login", "not a url", "--no-browser", "--data-dir", store.to_str().unwrap()],
    );

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid URL"));
}
