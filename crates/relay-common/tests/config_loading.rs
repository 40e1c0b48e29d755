//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "tests"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Configuration loading integration tests."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::time::Duration;

use relay_common::config::AppConfig;
use relay_common::LogFormat;

#[test]
fn load_from_explicit_toml_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("relay.toml");
    std::fs::write(
        &path,
        r#"
[relay]
topic_prefix = "lab"
forward_topic = "lab/processed"

[broadcaster]
interval = 0.5
clients = 2

[logging]
format = "pretty"
"#,
    )
    .expect("write config");

    let loaded = AppConfig::load_with_source(Some(&path)).expect("load config");
    assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
    let config = loaded.config;
    assert_eq!(config.relay.effective_filter(), "lab/#");
    assert_eq!(config.relay.forward_topic, "lab/processed");
    assert_eq!(config.broadcaster.interval, Duration::from_millis(500));
    assert_eq!(config.broadcaster.clients, 2);
    assert_eq!(config.logging.format, LogFormat::Pretty);
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");
    let err = AppConfig::load_with_source(Some(&path)).unwrap_err();
    assert!(format!("{err:#}").contains("absent.toml"));
}

#[test]
fn invalid_file_content_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[broker]\nqos = 7\n").expect("write config");
    assert!(AppConfig::load_with_source(Some(&path)).is_err());
}
