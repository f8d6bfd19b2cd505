//! Unit tests for configuration parsing and validation.

use std::time::Duration;

use parachute_sandbox::config::validate_slug;
use parachute_sandbox::models::session::TrustLevel;
use parachute_sandbox::{AppError, GlobalConfig};

fn with_data_dir(dir: &tempfile::TempDir, body: &str) -> String {
    format!(
        "data_dir = {:?}\n{body}",
        dir.path().join("data").display().to_string()
    )
}

#[test]
fn minimal_config_uses_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::from_toml_str(&with_data_dir(&dir, "")).expect("valid config");

    assert_eq!(config.default_trust, TrustLevel::Trusted);
    assert_eq!(config.container.runtime_bin, "docker");
    assert_eq!(config.container.name_prefix, "parachute-ws-");
    assert_eq!(config.container.workdir, "/workspace");
    assert_eq!(config.container.engine_command, vec!["parachute-agent"]);
    assert_eq!(config.container.idle_timeout(), Duration::from_secs(900));
    assert_eq!(config.container.max_concurrent_execs, 3);
    assert_eq!(config.engine.agent_type, "claude");
    assert_eq!(config.engine.history_turn_limit, 40);
    assert!(config.workspaces.is_empty());
}

#[test]
fn data_dir_is_created_and_canonicalized() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::from_toml_str(&with_data_dir(&dir, "")).expect("valid config");

    assert!(config.data_dir.is_dir());
    assert!(config.data_dir.is_absolute());
    assert_eq!(config.db_path(), config.data_dir.join("sessions.db"));
    assert_eq!(config.sandbox_storage_root(), config.data_dir.join("sandbox"));
}

#[test]
fn workspaces_parse_with_trust_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let body = r#"
default_trust = "untrusted"

[container]
idle_timeout_seconds = 60
max_concurrent_execs = 1

[[workspace]]
slug = "research"
directory = "/srv/research"
default_trust = "untrusted"

[[workspace]]
slug = "notes"
directory = "/srv/notes"
"#;
    let config = GlobalConfig::from_toml_str(&with_data_dir(&dir, body)).expect("valid config");

    assert_eq!(config.default_trust, TrustLevel::Untrusted);
    assert_eq!(config.container.idle_timeout_seconds, 60);
    assert_eq!(config.workspaces.len(), 2);
    let research = config.workspace("research").expect("research configured");
    assert_eq!(research.default_trust, Some(TrustLevel::Untrusted));
    assert_eq!(config.workspace("notes").expect("notes").default_trust, None);
    assert!(config.workspace("missing").is_none());
}

#[test]
fn zero_concurrency_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::from_toml_str(&with_data_dir(
        &dir,
        "[container]\nmax_concurrent_execs = 0\n",
    ))
    .expect_err("invalid");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("max_concurrent_execs")));
}

#[test]
fn zero_idle_timeout_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::from_toml_str(&with_data_dir(
        &dir,
        "[container]\nidle_timeout_seconds = 0\n",
    ))
    .expect_err("invalid");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("idle_timeout_seconds")));
}

#[test]
fn empty_engine_command_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::from_toml_str(&with_data_dir(
        &dir,
        "[container]\nengine_command = []\n",
    ))
    .expect_err("invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn duplicate_slugs_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let body = r#"
[[workspace]]
slug = "dup"
directory = "/a"

[[workspace]]
slug = "dup"
directory = "/b"
"#;
    let err = GlobalConfig::from_toml_str(&with_data_dir(&dir, body)).expect_err("invalid");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("duplicate workspace slug")));
}

#[test]
fn malformed_slug_in_config_is_a_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let body = "[[workspace]]\nslug = \"../escape\"\ndirectory = \"/a\"\n";
    let err = GlobalConfig::from_toml_str(&with_data_dir(&dir, body)).expect_err("invalid");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn unknown_trust_value_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::from_toml_str(&with_data_dir(&dir, "default_trust = \"maybe\"\n"))
        .expect_err("invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn load_from_missing_path_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::load_from_path(dir.path().join("nope.toml")).expect_err("missing");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("failed to read config")));
}

#[test]
fn slug_validation() {
    for ok in ["a", "research", "team_1", "x-y-z", "0abc"] {
        assert!(validate_slug(ok).is_ok(), "{ok} should be valid");
    }
    let long = "a".repeat(64);
    for bad in ["", "Upper", "-lead", "_lead", "a/b", "..", "a b", long.as_str()] {
        assert!(
            matches!(validate_slug(bad), Err(AppError::InvalidInput(_))),
            "{bad:?} should be rejected"
        );
    }
}
