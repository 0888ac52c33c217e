//! End-to-end daemon tests: file input -> publisher -> file output, with
//! checkpoint resume across restarts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ironbeat_core::config::{InputConfig, IronbeatConfig};
use ironbeat_daemon::checkpoint::{CHECKPOINT_FILE, CheckpointRegistry};
use ironbeat_daemon::orchestrator::Orchestrator;

struct Layout {
    _dir: tempfile::TempDir,
    data_dir: PathBuf,
    input: PathBuf,
    output: PathBuf,
}

fn layout() -> Layout {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let input = dir.path().join("app.log");
    let output = dir.path().join("out").join("events.ndjson");
    Layout {
        _dir: dir,
        data_dir,
        input,
        output,
    }
}

fn config(layout: &Layout, publish_mode: &str) -> IronbeatConfig {
    let mut config = IronbeatConfig::default();
    config.general.data_dir = layout.data_dir.display().to_string();
    config.publisher.index = String::new();
    config.publisher.batch.flush_timeout_ms = 10;

    config.output.output_type = "file".to_owned();
    config.output.settings.insert(
        "path".to_owned(),
        toml::Value::String(layout.output.display().to_string()),
    );

    config.inputs.push(InputConfig {
        id: "app".to_owned(),
        paths: vec![layout.input.display().to_string()],
        tags: vec!["e2e".to_owned()],
        publish_mode: publish_mode.to_owned(),
        wait_close_secs: 5,
        ..InputConfig::default()
    });
    config
}

/// Messages written to the output file, in order.
fn delivered(path: &Path) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .map(|line| {
            let doc: serde_json::Value = serde_json::from_str(line).unwrap();
            doc["message"].as_str().unwrap().to_owned()
        })
        .collect()
}

/// Resolves once the output holds `n` events.
async fn until_delivered(path: PathBuf, n: usize) {
    for _ in 0..1000 {
        if delivered(&path).len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("output never reached {n} events");
}

async fn run_once(config: IronbeatConfig, output: &Path, expected: usize) {
    let mut orchestrator = Orchestrator::build_from_config(config).await.unwrap();
    orchestrator
        .run_until(until_delivered(output.to_path_buf(), expected))
        .await
        .unwrap();
}

#[tokio::test]
async fn ships_lines_and_resumes_after_restart() {
    // Given: an input file with two lines
    let layout = layout();
    std::fs::write(&layout.input, "one\ntwo\n").unwrap();

    // When: the daemon runs until both are delivered
    run_once(config(&layout, "guaranteed"), &layout.output, 2).await;

    // Then: the acknowledged offset is persisted
    let key = format!("app:{}", layout.input.display());
    let checkpoints = CheckpointRegistry::load(layout.data_dir.join(CHECKPOINT_FILE)).unwrap();
    assert_eq!(checkpoints.offset(&key), Some(8));

    // When: a line is appended and the daemon restarts
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&layout.input)
        .unwrap();
    std::io::Write::write_all(&mut file, b"three\n").unwrap();
    run_once(config(&layout, "guaranteed"), &layout.output, 3).await;

    // Then: only the new line is shipped
    assert_eq!(delivered(&layout.output), vec!["one", "two", "three"]);
    let checkpoints = CheckpointRegistry::load(layout.data_dir.join(CHECKPOINT_FILE)).unwrap();
    assert_eq!(checkpoints.offset(&key), Some(14));
}

#[tokio::test]
async fn events_carry_input_metadata() {
    let layout = layout();
    std::fs::write(&layout.input, "hello\n").unwrap();

    run_once(config(&layout, "guaranteed"), &layout.output, 1).await;

    let contents = std::fs::read_to_string(&layout.output).unwrap();
    let doc: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(doc["message"], "hello");
    assert_eq!(doc["tags"], serde_json::json!(["e2e"]));
    assert_eq!(doc["log"]["offset"], 0);
    assert_eq!(doc["input"]["type"], "file");
    assert!(doc.get("@timestamp").is_some());
}

#[tokio::test]
async fn best_effort_input_advances_checkpoint() {
    let layout = layout();
    std::fs::write(&layout.input, "a\nb\n").unwrap();

    run_once(config(&layout, "best_effort"), &layout.output, 2).await;

    let key = format!("app:{}", layout.input.display());
    let checkpoints = CheckpointRegistry::load(layout.data_dir.join(CHECKPOINT_FILE)).unwrap();
    assert_eq!(checkpoints.offset(&key), Some(4));
}

#[tokio::test]
async fn missing_input_file_does_not_block_shutdown() {
    let layout = layout();

    let mut orchestrator = Orchestrator::build_from_config(config(&layout, "guaranteed"))
        .await
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run_until(tokio::time::sleep(Duration::from_millis(50))),
    )
    .await
    .expect("shutdown should not hang")
    .unwrap();
    assert!(delivered(&layout.output).is_empty());
}
