use std::io::Write;
use std::time::Duration;

use interaction_relay::{config::GlobalConfig, AppError};

fn sample_toml() -> &'static str {
    r#"
database_path = "var/relay.db"
http_port = 9090
ipc_name = "relay-test"

[broker]
ready_exchange = "leads.ready"
destination_queue = "leads.scheduled"
delay_queue = "leads.delay"
routing_key = "fire"
delay_tiers_seconds = [5, 30]
prefetch = 4

[poller]
enabled = false
interval_seconds = 15
batch_size = 20
max_concurrency = 2
stale_claim_seconds = 600

[delivery]
webhook_url = "https://ai.example.com/hooks/scheduled"
timeout_seconds = 10
early_tolerance_ms = 250
"#
}

fn expect_config_error(raw: &str, needle: &str) {
    match GlobalConfig::from_toml_str(raw) {
        Err(AppError::Config(msg)) => assert!(msg.contains(needle), "unexpected message: {msg}"),
        other => panic!("expected config error containing '{needle}', got {other:?}"),
    }
}

#[test]
fn parses_full_config() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config parses");

    assert_eq!(config.database_path.to_str(), Some("var/relay.db"));
    assert_eq!(config.http_port, 9090);
    assert_eq!(config.ipc_name, "relay-test");
    assert_eq!(config.broker.ready_exchange, "leads.ready");
    assert_eq!(config.broker.routing_key, "fire");
    assert_eq!(config.broker.delay_tiers_seconds, vec![5, 30]);
    assert_eq!(config.broker.prefetch, 4);
    assert!(!config.poller.enabled);
    assert_eq!(config.poller.batch_size, 20);
    assert_eq!(config.poll_interval(), Duration::from_secs(15));
    assert_eq!(config.delivery_timeout(), Duration::from_secs(10));
    assert_eq!(config.delivery.early_tolerance_ms, 250);
    assert_eq!(
        config.delivery.webhook_url.as_deref(),
        Some("https://ai.example.com/hooks/scheduled")
    );
}

#[test]
fn empty_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("defaults parse");

    assert_eq!(config, GlobalConfig::default());
    assert_eq!(config.broker.delay_tiers_seconds, vec![10, 60, 600, 3600, 86_400]);
    assert_eq!(config.broker.prefetch, 10);
    assert!(config.poller.enabled);
    assert_eq!(config.poller.batch_size, 50);
    assert_eq!(config.poller.stale_claim_seconds, 900);
    assert_eq!(config.delivery.timeout_seconds, 30);
    assert!(config.delivery.webhook_url.is_none());
}

#[test]
fn secrets_are_never_read_from_toml() {
    let config = GlobalConfig::from_toml_str(
        r#"
[delivery]
webhook_token = "leaked"
"#,
    )
    .expect("unknown secret field is ignored");
    assert!(config.delivery.webhook_token.is_none());
    assert!(config.ipc_auth_token.is_none());
}

#[test]
fn rejects_zero_batch_size() {
    expect_config_error("[poller]\nbatch_size = 0\n", "batch_size");
}

#[test]
fn rejects_zero_concurrency() {
    expect_config_error("[poller]\nmax_concurrency = 0\n", "max_concurrency");
}

#[test]
fn rejects_zero_interval() {
    expect_config_error("[poller]\ninterval_seconds = 0\n", "interval_seconds");
}

#[test]
fn rejects_zero_timeout() {
    expect_config_error("[delivery]\ntimeout_seconds = 0\n", "timeout_seconds");
}

#[test]
fn stale_claim_must_outlast_a_delivery() {
    expect_config_error(
        "[poller]\nstale_claim_seconds = 1\n[delivery]\ntimeout_seconds = 30\n",
        "stale_claim_seconds",
    );
    expect_config_error("[poller]\nstale_claim_seconds = 0\n", "stale_claim_seconds");
    expect_config_error(
        "[poller]\nstale_claim_seconds = 89\n[delivery]\ntimeout_seconds = 30\n",
        "(90)",
    );

    let config = GlobalConfig::from_toml_str(
        "[poller]\nstale_claim_seconds = 90\n[delivery]\ntimeout_seconds = 30\n",
    )
    .expect("timeout plus margin is enough");
    assert_eq!(config.poller.stale_claim_seconds, 90);
}

#[test]
fn raising_the_timeout_requires_a_longer_stale_claim() {
    expect_config_error("[delivery]\ntimeout_seconds = 900\n", "stale_claim_seconds");
}

#[test]
fn rejects_unordered_tiers() {
    expect_config_error(
        "[broker]\ndelay_tiers_seconds = [60, 10]\n",
        "strictly increasing",
    );
    expect_config_error(
        "[broker]\ndelay_tiers_seconds = [10, 10]\n",
        "strictly increasing",
    );
}

#[test]
fn rejects_zero_tier() {
    expect_config_error("[broker]\ndelay_tiers_seconds = [0, 10]\n", "greater than zero");
}

#[test]
fn empty_tier_list_is_allowed() {
    let config =
        GlobalConfig::from_toml_str("[broker]\ndelay_tiers_seconds = []\n").expect("valid");
    assert!(config.broker.delay_tiers_seconds.is_empty());
}

#[test]
fn rejects_blank_names() {
    expect_config_error("[broker]\nrouting_key = \" \"\n", "broker.routing_key");
}

#[test]
fn rejects_non_http_webhook() {
    expect_config_error(
        "[delivery]\nwebhook_url = \"ftp://example.com\"\n",
        "http(s)",
    );
}

#[test]
fn rejects_malformed_toml() {
    expect_config_error("[poller\nbatch_size = 1", "invalid config");
}

#[test]
fn load_from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write");

    let config = GlobalConfig::load_from_path(file.path()).expect("loads");
    assert_eq!(config.http_port, 9090);
}

#[test]
fn load_from_missing_path_is_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = GlobalConfig::load_from_path(temp.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(_))));
}
