//! ---
//! relay_section: "15-testing-qa-runbook"
//! relay_subsection: "integration-tests"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Integration and validation tests for the relay stack."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::time::Duration;

use relay_common::AppConfig;
use relay_core::RelaySettings;
use relay_msg::QosLevel;

fn read(path: &str) -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let full = Path::new(manifest_dir).join("..").join(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn example_config_has_frontmatter_and_parses() {
    let content = read("configs/relay.example.toml");
    assert!(
        content.starts_with("# ---"),
        "example config must include frontmatter header"
    );

    let config: AppConfig = content.parse().expect("example config parses");
    assert_eq!(config.broker.port, 1883);
    assert_eq!(config.broker.channel_capacity, 64);
    assert_eq!(config.relay.effective_filter(), "sandbox/#");
    assert_eq!(config.transform.timeout, Duration::from_secs(5));
    assert_eq!(config.broadcaster.clients, 3);
}

#[test]
fn example_config_builds_relay_settings() {
    let config: AppConfig = read("configs/relay.example.toml")
        .parse()
        .expect("example config parses");
    let settings = RelaySettings::from_config(&config).expect("relay settings");
    assert_eq!(settings.qos, QosLevel::AtLeastOnce);
    assert_eq!(settings.filter.literal_prefix_depth(), 1);
    assert!(
        settings.filter.matches(&settings.forward_topic),
        "default layout relies on skipping the forward topic"
    );
}
