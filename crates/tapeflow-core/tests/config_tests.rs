use std::time::Duration;

use tapeflow_core::{SessionConfig, TapeflowError};

#[test]
fn partial_document_fills_in_defaults() -> Result<(), Box<dyn std::error::Error>> {
    let config: SessionConfig = serde_json::from_str(
        r#"{ "disk_threads": 8, "block_count": 32, "client_timeout": { "secs": 5, "nanos": 0 } }"#,
    )?;

    assert_eq!(config.disk_threads, 8);
    assert_eq!(config.block_count, 32);
    assert_eq!(config.client_timeout, Duration::from_secs(5));
    assert_eq!(config.block_size, SessionConfig::default().block_size);
    assert!(config.use_lbp);
    config.validate()?;
    Ok(())
}

#[test]
fn defaults_survive_a_json_trip() -> Result<(), Box<dyn std::error::Error>> {
    let config = SessionConfig::default();
    let text = serde_json::to_string(&config)?;
    let back: SessionConfig = serde_json::from_str(&text)?;
    assert_eq!(back, config);
    back.validate()?;
    Ok(())
}

#[test]
fn too_few_blocks_for_the_disk_threads_is_rejected() {
    let config = SessionConfig {
        block_count: 7,
        disk_threads: 4,
        ..SessionConfig::default()
    };
    let err = config.validate().err();
    assert!(matches!(
        err,
        Some(TapeflowError::InvalidConfig(message)) if message.contains("block_count")
    ));
}

#[test]
fn zero_values_are_rejected() {
    for config in [
        SessionConfig {
            block_size: 0,
            ..SessionConfig::default()
        },
        SessionConfig {
            files_before_flush: 0,
            ..SessionConfig::default()
        },
        SessionConfig {
            heartbeat_period: Duration::ZERO,
            ..SessionConfig::default()
        },
    ] {
        assert!(matches!(config.validate(), Err(TapeflowError::InvalidConfig(_))));
    }
}

#[test]
fn migration_credits_split_the_pool_between_readers() {
    let config = SessionConfig {
        block_count: 16,
        disk_threads: 3,
        ..SessionConfig::default()
    };
    assert_eq!(config.migration_credits_per_file(), 5);
    assert!(config.migration_credits_per_file() * config.disk_threads <= config.block_count);
}
