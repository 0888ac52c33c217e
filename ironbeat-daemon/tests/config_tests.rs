//! Configuration layering as the daemon applies it: file, environment, command line.

use std::env;

use clap::Parser;
use ironbeat_core::config::IronbeatConfig;
use ironbeat_daemon::cli::DaemonCli;
use serial_test::serial;

fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ironbeat.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

#[tokio::test]
#[serial]
async fn env_overrides_file_values() {
    // Given: a config file with memory queue and info level
    let (_dir, path) = write_config(
        r#"
[general]
log_level = "info"

[publisher.queue]
mode = "memory"
"#,
    );

    // When: loading with environment overrides set
    unsafe {
        env::set_var("IRONBEAT_GENERAL_LOG_LEVEL", "debug");
        env::set_var("IRONBEAT_PUBLISHER_BATCH_WORKERS", "4");
    }
    let config = IronbeatConfig::load(&path).await;
    unsafe {
        env::remove_var("IRONBEAT_GENERAL_LOG_LEVEL");
        env::remove_var("IRONBEAT_PUBLISHER_BATCH_WORKERS");
    }

    // Then: environment wins
    let config = config.unwrap();
    assert_eq!(config.general.log_level, "debug");
    assert_eq!(config.publisher.batch.workers, 4);
    assert_eq!(config.publisher.queue.mode, "memory");
}

#[tokio::test]
#[serial]
async fn invalid_env_override_fails_validation() {
    let (_dir, path) = write_config("");

    unsafe { env::set_var("IRONBEAT_PUBLISHER_QUEUE_MODE", "tape") };
    let result = IronbeatConfig::load(&path).await;
    unsafe { env::remove_var("IRONBEAT_PUBLISHER_QUEUE_MODE") };

    let err = result.unwrap_err();
    assert!(err.to_string().contains("publisher.queue.mode"), "got: {err}");
}

#[tokio::test]
#[serial]
async fn cli_overrides_env() {
    let (_dir, path) = write_config("[general]\nlog_format = \"json\"\n");

    unsafe { env::set_var("IRONBEAT_GENERAL_LOG_FORMAT", "json") };
    let mut config = IronbeatConfig::load(&path).await.unwrap();
    unsafe { env::remove_var("IRONBEAT_GENERAL_LOG_FORMAT") };

    let cli = DaemonCli::parse_from([
        "ironbeat-daemon",
        "--config",
        path.to_str().unwrap(),
        "--log-format",
        "pretty",
    ]);
    cli.apply_overrides(&mut config);

    assert_eq!(config.general.log_format, "pretty");
    config.validate().unwrap();
}
