mod support;

use mirror_solana_connector::{
    accounts::{StreamSubscriberOptions, WebSocketSubscriberOptions},
    config::{load_config, ConnectorConfig, LogProviderConfig, PollingLogConfig},
    events::{
        providers::{build_log_provider, LogTransports},
        EventSubscriberOptions, OrderBy, OrderDir,
    },
};
use solana_sdk::commitment_config::CommitmentLevel;
use std::{io::Write, time::Duration};
use support::{program, MockPubsub, MockRpc};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> anyhow::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn load(file: &NamedTempFile) -> anyhow::Result<ConnectorConfig> {
    let path = file.path().to_string_lossy().to_string();
    load_config(&path)
}

#[test]
fn test_load_full_config() -> anyhow::Result<()> {
    let file = write_config(
        r#"
[solana]
rpc-url = "http://rpc.test:8899"
ws-url = "ws://rpc.test:8900"

[accounts]
resub-timeout-ms = 3000
polling-fallback-ms = 1500
max-reconnect-attempts = 2

[loader]
chunk-size = 50
polling-frequency-ms = 400

[multiplexer]
debounce-ms = 20

[events]
event-types = ["Deposited"]
max-events-per-type = 16
order-by = "client"
order-dir = "asc"
skip-failed-transactions = false
backfill-page-size = 0

[events.log-provider]
type = "relay"
url = "wss://relay.test"
"#,
    )?;

    let config = load(&file)?;

    assert_eq!(config.solana.rpc_url, "http://rpc.test:8899");
    assert_eq!(config.accounts.resub_timeout(), Some(Duration::from_secs(3)));
    assert_eq!(config.accounts.max_reconnect_attempts, 2);
    assert_eq!(config.loader.chunk_size, 50);
    assert_eq!(config.loader.polling_frequency(), Duration::from_millis(400));
    assert_eq!(config.loader.max_concurrent_chunks, 10);
    assert_eq!(config.multiplexer.debounce(), Duration::from_millis(20));
    assert_eq!(config.multiplexer.ping_interval(), Duration::from_secs(10));
    assert_eq!(
        config.events.log_provider,
        LogProviderConfig::Relay {
            url: "wss://relay.test".to_string(),
            resub_timeout_ms: None,
            max_reconnect_attempts: 5,
        }
    );

    let options = EventSubscriberOptions::from_config(&config.events, CommitmentLevel::Confirmed);
    assert_eq!(options.order_by, OrderBy::Client);
    assert_eq!(options.order_dir, OrderDir::Asc);
    assert!(!options.skip_failed_transactions);
    assert_eq!(options.backfill_page_size, 1);
    assert!(options
        .event_types
        .is_some_and(|types| types.contains("Deposited") && types.len() == 1));

    let ws = WebSocketSubscriberOptions::from_config(&config.accounts, CommitmentLevel::Processed);
    assert_eq!(ws.resub_timeout, Some(Duration::from_secs(3)));
    assert_eq!(
        ws.polling_fallback.map(|fallback| fallback.interval),
        Some(Duration::from_millis(1500))
    );
    let stream = StreamSubscriberOptions::from_config(&config.accounts, CommitmentLevel::Processed);
    assert_eq!(stream.commitment, CommitmentLevel::Processed);
    Ok(())
}

#[test]
fn test_missing_sections_fall_back_to_defaults() -> anyhow::Result<()> {
    let file = write_config("[loader]\nchunk-size = 10\n")?;

    let config = load(&file)?;

    assert_eq!(config.loader.chunk_size, 10);
    assert_eq!(config.solana.rpc_url, "http://127.0.0.1:8899");
    assert_eq!(config.events.max_tx, 4096);
    assert!(config.events.skip_failed_transactions);
    assert!(config.events.event_types.is_empty());
    assert_eq!(config.accounts.resub_timeout(), None);
    assert!(matches!(
        config.events.log_provider,
        LogProviderConfig::Websocket {
            fallback: Some(_),
            ..
        }
    ));
    assert!(EventSubscriberOptions::from_config(&config.events, CommitmentLevel::Confirmed)
        .event_types
        .is_none());
    Ok(())
}

#[test]
fn test_polling_log_provider_section() -> anyhow::Result<()> {
    let file = write_config(
        "[events.log-provider]\ntype = \"polling\"\nfrequency-ms = 250\n",
    )?;

    let config = load(&file)?;

    assert_eq!(
        config.events.log_provider,
        LogProviderConfig::Polling(PollingLogConfig {
            frequency_ms: 250,
            batch_size: 100,
        })
    );
    Ok(())
}

#[test]
fn test_unknown_commitment_is_rejected() -> anyhow::Result<()> {
    let file = write_config("[solana]\ncommitment = \"eventually\"\n")?;
    assert!(load(&file).is_err());
    Ok(())
}

#[test]
fn test_environment_overrides_file() -> anyhow::Result<()> {
    let file = write_config("[solana]\ncommitment = \"finalized\"\n")?;
    assert_eq!(load(&file)?.solana.commitment, CommitmentLevel::Finalized);

    std::env::set_var("MIRROR__SOLANA__COMMITMENT", "processed");
    let overridden = load(&file);
    std::env::remove_var("MIRROR__SOLANA__COMMITMENT");

    assert_eq!(overridden?.solana.commitment, CommitmentLevel::Processed);
    Ok(())
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(load_config("/nonexistent/mirror-connector.toml").is_err());
}

#[tokio::test]
async fn test_build_log_provider_from_config() {
    let transports = LogTransports {
        pubsub: MockPubsub::new(),
        history: MockRpc::new(),
    };
    for config in [
        LogProviderConfig::default(),
        LogProviderConfig::Polling(PollingLogConfig::default()),
        LogProviderConfig::Relay {
            url: "ws://127.0.0.1:1".to_string(),
            resub_timeout_ms: Some(1000),
            max_reconnect_attempts: 1,
        },
    ] {
        let provider = build_log_provider(
            &config,
            program(),
            CommitmentLevel::Confirmed,
            transports.clone(),
        );
        assert!(!provider.is_subscribed());
    }
}
