//! Garbage buffer and fallback spill file.
//!
//! Envelopes whose durable write failed land in the garbage buffer. A
//! separate timer appends the buffer to a framed spill file so they can be
//! recovered by an operator. Each record is `MAGIC | VERSION | len | crc32`
//! followed by the JSON-encoded envelope.

use crate::message::MessageEnvelope;
use crate::store::telemetry;
use crate::{Error, Result};
use crc32fast::Hasher;
use parking_lot::Mutex;
use std::fs::File as StdFile;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"LBSP";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 13;

/// Spill file configuration.
#[derive(Debug, Clone)]
pub struct SpillConfig {
    /// Spill file path. `None` keeps failed envelopes in memory only.
    pub path: Option<PathBuf>,
    /// How often the garbage buffer is flushed to the spill file.
    pub flush_interval: Duration,
    /// Garbage buffer cap; the oldest envelopes are discarded beyond it.
    pub max_buffered: usize,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("/var/lib/logbarrel/spill.log")),
            flush_interval: Duration::from_secs(30),
            max_buffered: 100_000,
        }
    }
}

/// Append-only framed spill file.
#[derive(Debug, Clone)]
pub struct SpillFile {
    path: PathBuf,
}

impl SpillFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `envelopes`, one framed record each.
    pub async fn append(&self, envelopes: &[Arc<MessageEnvelope>]) -> Result<usize> {
        if envelopes.is_empty() {
            return Ok(0);
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut buf = Vec::new();
        for env in envelopes {
            let payload = serde_json::to_vec(&**env)?;
            buf.extend_from_slice(&encode_header(&payload));
            buf.extend_from_slice(&payload);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(envelopes.len())
    }

    /// Read every intact record. A truncated or corrupt tail ends the scan.
    pub fn read_all(&self) -> Result<Vec<MessageEnvelope>> {
        let file = match StdFile::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut out = Vec::new();
        loop {
            let mut header = [0u8; HEADER_LEN];
            match read_exact_or_eof(&mut reader, &mut header) {
                Ok(false) => break,
                Ok(true) => {}
                Err(_) => {
                    warn!(path = ?self.path, records = out.len(), "Truncated spill header, stopping");
                    break;
                }
            }
            let (len, expected_crc) = match decode_header(&header) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = ?self.path, records = out.len(), error = %e, "Corrupt spill header, stopping");
                    break;
                }
            };
            let mut payload = vec![0u8; len];
            if !matches!(read_exact_or_eof(&mut reader, &mut payload), Ok(true)) {
                warn!(path = ?self.path, "Truncated spill record, discarding");
                break;
            }
            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != expected_crc {
                warn!(path = ?self.path, "Spill CRC mismatch, discarding trailing record");
                break;
            }
            match serde_json::from_slice::<MessageEnvelope>(&payload) {
                Ok(env) => out.push(env),
                Err(e) => warn!(path = ?self.path, error = %e, "Undecodable spill record, skipping"),
            }
        }
        Ok(out)
    }
}

fn encode_header(payload: &[u8]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4] = VERSION;
    header[5..9].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    let mut hasher = Hasher::new();
    hasher.update(payload);
    header[9..13].copy_from_slice(&hasher.finalize().to_le_bytes());
    header
}

fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(usize, u32)> {
    if &header[0..4] != MAGIC {
        return Err(Error::Serialization("Invalid spill magic".to_string()));
    }
    if header[4] != VERSION {
        return Err(Error::Serialization("Unsupported spill version".to_string()));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[5..9]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&header[9..13]);
    Ok((u32::from_le_bytes(len) as usize, u32::from_le_bytes(crc)))
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<bool> {
    let mut offset = 0;
    while offset < buffer.len() {
        let read = reader.read(&mut buffer[offset..])?;
        if read == 0 {
            if offset == 0 {
                return Ok(false);
            }
            return Err(Error::Serialization("Truncated spill record".to_string()));
        }
        offset += read;
    }
    Ok(true)
}

/// In-memory garbage buffer flushed to a [`SpillFile`] on a timer.
pub struct GarbageSpill {
    buffer: Mutex<Vec<Arc<MessageEnvelope>>>,
    file: Option<SpillFile>,
    config: SpillConfig,
}

impl GarbageSpill {
    pub fn new(config: SpillConfig) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            file: config.path.clone().map(SpillFile::new),
            config,
        }
    }

    /// Memory-only garbage buffer.
    pub fn in_memory() -> Self {
        Self::new(SpillConfig {
            path: None,
            ..Default::default()
        })
    }

    pub fn push(&self, envelopes: Vec<Arc<MessageEnvelope>>) {
        if envelopes.is_empty() {
            return;
        }
        let mut buffer = self.buffer.lock();
        buffer.extend(envelopes);
        let overflow = buffer.len().saturating_sub(self.config.max_buffered);
        if overflow > 0 {
            buffer.drain(..overflow);
            telemetry::record_spill_discarded(overflow as u64);
            warn!(discarded = overflow, "Garbage buffer full, discarding oldest envelopes");
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn file(&self) -> Option<&SpillFile> {
        self.file.as_ref()
    }

    /// Write the buffered envelopes to the spill file. On failure they are
    /// put back at the front of the buffer.
    pub async fn flush(&self) -> Result<usize> {
        let Some(file) = &self.file else {
            return Ok(0);
        };
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(0);
        }
        match file.append(&batch).await {
            Ok(n) => {
                telemetry::record_spilled(n as u64);
                debug!(records = n, path = ?file.path(), "Flushed garbage buffer");
                Ok(n)
            }
            Err(e) => {
                let mut buffer = self.buffer.lock();
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                Err(e)
            }
        }
    }

    /// Flush on `flush_interval` until `shutdown` fires, then flush once more.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Spill flush failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Spill timer shutting down, final flush");
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Final spill flush failed");
                    }
                    return;
                }
            }
        }
    }
}
