//! Line-oriented file input.
//!
//! Each configured path is tailed by its own [`FileInput`], which publishes
//! one event per line through a dedicated publisher client. The byte offset
//! right after the line travels with the event as its private value and is
//! written to the [`CheckpointRegistry`] once the output acknowledges it, so
//! a restart resumes after the last delivered line.
//!
//! # Source Keys
//!
//! A source is identified by `"{id}:{path}"`, or just the path when the
//! input has no `id`.
//!
//! # Truncation
//!
//! If the file becomes shorter than the current offset (copytruncate style
//! rotation), reading restarts from offset 0.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ironbeat_core::config::InputConfig;
use ironbeat_core::event::{Event, Fields, Private};
use ironbeat_core::metrics as m;
use ironbeat_publisher::ack::{self, SharedListener};
use ironbeat_publisher::{Client, ClientConfig, PublishMode, PublisherPipeline};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointRegistry;

/// Input type name in `[[inputs]] type = "..."`.
pub const INPUT_TYPE_FILE: &str = "file";

/// How often to look for new data at end of file.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lines longer than this are truncated in the published event.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Private value attached to every published line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePosition {
    /// Source key (see module docs).
    pub source: Arc<str>,
    /// Byte offset right after the line, including its newline.
    pub offset: u64,
}

/// Checkpoint key for `path` under `input`.
pub fn source_key(input: &InputConfig, path: &str) -> String {
    if input.id.is_empty() {
        path.to_owned()
    } else {
        format!("{}:{}", input.id, path)
    }
}

/// Acknowledgment listener that advances checkpoints from [`LinePosition`]s.
pub fn checkpoint_listener(checkpoints: Arc<CheckpointRegistry>) -> SharedListener {
    ack::private_reporter(move |privates: Vec<Private>| {
        for private in &privates {
            if let Some(pos) = private.downcast_ref::<LinePosition>() {
                checkpoints.advance(&pos.source, pos.offset);
            }
        }
    })
}

/// Why the read loop stopped.
enum ReadEnd {
    Cancelled,
    Truncated,
    ClientClosed,
}

/// Tails one file and publishes its lines.
pub struct FileInput {
    source: Arc<str>,
    path: PathBuf,
    client: Arc<Client>,
    checkpoints: Arc<CheckpointRegistry>,
    poll_interval: Duration,
    lines_read: u64,
}

impl FileInput {
    /// Connect a publisher client for `path`.
    ///
    /// Guaranteed clients advance checkpoints from acknowledgments.
    /// Best-effort clients advance them as soon as a line is queued.
    pub async fn connect(
        pipeline: &PublisherPipeline,
        input: &InputConfig,
        path: &str,
        checkpoints: Arc<CheckpointRegistry>,
    ) -> Result<Self> {
        let key = source_key(input, path);
        let mut config = ClientConfig::from_input(key.clone(), input)?;
        if config.mode == PublishMode::Guaranteed {
            config = config.with_listener(checkpoint_listener(Arc::clone(&checkpoints)));
        }
        let client = pipeline.connect_with(config).await?;

        Ok(Self {
            source: Arc::from(key),
            path: PathBuf::from(path),
            client,
            checkpoints,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lines_read: 0,
        })
    }

    /// Override the end-of-file polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Source key used for checkpoints.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Read until `cancel` fires or the pipeline closes, then close the client.
    ///
    /// Returns the number of lines published.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        tracing::info!(source = %self.source, path = %self.path.display(), "file input started");

        let mut offset = self.checkpoints.offset(&self.source).unwrap_or(0);
        loop {
            let Some(file) = self.open_at(&mut offset, &cancel).await else {
                break;
            };
            match self.read_lines(file, &mut offset, &cancel).await {
                ReadEnd::Truncated => {
                    tracing::warn!(
                        source = %self.source,
                        offset,
                        "file truncated, restarting from the beginning"
                    );
                    offset = 0;
                    self.checkpoints.reset(&self.source);
                }
                ReadEnd::Cancelled | ReadEnd::ClientClosed => break,
            }
        }

        self.client.close().await;
        tracing::info!(
            source = %self.source,
            lines = self.lines_read,
            offset,
            "file input stopped"
        );
        self.lines_read
    }

    /// Open the file and seek to `offset`, waiting for it to appear.
    async fn open_at(&self, offset: &mut u64, cancel: &CancellationToken) -> Option<File> {
        let mut reported = false;
        loop {
            match File::open(&self.path).await {
                Ok(mut file) => {
                    let len = match file.metadata().await {
                        Ok(meta) => meta.len(),
                        Err(e) => {
                            tracing::warn!(path = %self.path.display(), error = %e, "failed to stat file");
                            0
                        }
                    };
                    if *offset > len {
                        tracing::warn!(
                            source = %self.source,
                            checkpoint = *offset,
                            len,
                            "checkpoint beyond end of file, starting over"
                        );
                        *offset = 0;
                        self.checkpoints.reset(&self.source);
                    }
                    match file.seek(SeekFrom::Start(*offset)).await {
                        Ok(_) => return Some(file),
                        Err(e) => {
                            tracing::warn!(path = %self.path.display(), error = %e, "failed to seek");
                        }
                    }
                }
                Err(e) if !reported => {
                    tracing::warn!(path = %self.path.display(), error = %e, "waiting for file");
                    reported = true;
                }
                Err(_) => {}
            }
            if !sleep_or_cancel(self.poll_interval, cancel).await {
                return None;
            }
        }
    }

    async fn read_lines(
        &mut self,
        file: File,
        offset: &mut u64,
        cancel: &CancellationToken,
    ) -> ReadEnd {
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return ReadEnd::Cancelled;
            }
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => {
                    if self.is_truncated(*offset).await {
                        return ReadEnd::Truncated;
                    }
                    if !sleep_or_cancel(self.poll_interval, cancel).await {
                        return ReadEnd::Cancelled;
                    }
                    continue;
                }
                Ok(_) if line.last() != Some(&b'\n') => {
                    // partial line at EOF; the rest is appended on the next read
                    if !sleep_or_cancel(self.poll_interval, cancel).await {
                        return ReadEnd::Cancelled;
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "read failed");
                    if !sleep_or_cancel(self.poll_interval, cancel).await {
                        return ReadEnd::Cancelled;
                    }
                    continue;
                }
            }

            let start = *offset;
            let end = start + line.len() as u64;
            let event = self.line_event(&line, start, end);
            line.clear();
            *offset = end;

            metrics::counter!(m::INPUT_LINES_READ_TOTAL, m::LABEL_INPUT => self.source.to_string())
                .increment(1);

            match self.client.publish(event).await {
                Ok(()) => {
                    self.lines_read += 1;
                    if self.client.mode() == PublishMode::BestEffort {
                        self.checkpoints.advance(&self.source, end);
                    }
                }
                Err(e) if e.is_closed() => {
                    tracing::debug!(source = %self.source, "publisher closed, stopping input");
                    return ReadEnd::ClientClosed;
                }
                Err(e) => {
                    tracing::warn!(source = %self.source, offset = start, error = %e, "failed to publish line");
                }
            }
        }
    }

    async fn is_truncated(&self, offset: u64) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len() < offset,
            Err(_) => false,
        }
    }

    fn line_event(&self, raw: &[u8], start: u64, end: u64) -> Event {
        let mut text = raw.strip_suffix(b"\n").unwrap_or(raw);
        text = text.strip_suffix(b"\r").unwrap_or(text);
        if text.len() > MAX_LINE_BYTES {
            text = &text[..MAX_LINE_BYTES];
        }

        let mut fields = Fields::new();
        fields.put("message", String::from_utf8_lossy(text).into_owned());
        fields.put("input.type", INPUT_TYPE_FILE);
        fields.put("log.file.path", self.path.display().to_string());
        fields.put("log.offset", start);

        Event::new(fields).with_private(LinePosition {
            source: Arc::clone(&self.source),
            offset: end,
        })
    }
}

/// Sleep for `duration`. Returns `false` if `cancel` fired first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
