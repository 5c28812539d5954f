//! Write-ahead log for replica log entries
//!
//! Each entry is one frame in a numbered segment file:
//!
//! ```text
//! magic "SHWA" | version u8 | reserved u8 | seq u64 | len u32 | crc32 u32 | payload
//! ```
//!
//! The payload is a length-prefixed JSON header (epoch, batch id) followed by
//! the rows as an Arrow IPC stream. Sequence numbers come from the shard's
//! primary, so the log only checks that they increase. A scan stops at the
//! first short or corrupt frame, which is where a crash interrupted a write.

use super::LogEntry;
use crate::schema::{batch_to_rows, rows_to_batch};
use crate::{Error, Result};
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"SHWA";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 22;

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Parent directory; each node logs under its own subdirectory
    pub wal_dir: PathBuf,
    /// Segment size that triggers rotation, 0 for a single segment
    pub max_segment_size: usize,
    pub sync_mode: WalSyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("/var/lib/shardhouse/wal"),
            max_segment_size: 64 * 1024 * 1024,
            sync_mode: WalSyncMode::EveryWrite,
        }
    }
}

impl WalConfig {
    pub fn for_node(&self, node_id: &str) -> Self {
        Self {
            wal_dir: self.wal_dir.join(node_id),
            ..self.clone()
        }
    }
}

/// When appended frames are forced to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncMode {
    EveryWrite,
    /// At most once per interval; a crash may lose the frames since
    Interval(Duration),
    OnRotation,
    None,
}

impl FromStr for WalSyncMode {
    type Err = Error;

    /// `every_write`, `on_rotation`, `none`, or `interval_<n>ms` / `interval_<n>s`
    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        let invalid = || {
            Error::Config(format!(
                "WAL sync mode '{raw}' is not every_write, on_rotation, none or interval_<n>ms"
            ))
        };
        match raw.as_str() {
            "every_write" => return Ok(Self::EveryWrite),
            "on_rotation" => return Ok(Self::OnRotation),
            "none" => return Ok(Self::None),
            _ => {}
        }
        let period = raw.strip_prefix("interval_").ok_or_else(invalid)?;
        let (digits, scale) = match period.strip_suffix("ms") {
            Some(ms) => (ms, 1),
            None => (period.strip_suffix('s').ok_or_else(invalid)?, 1_000),
        };
        let count: u64 = digits.parse().map_err(|_| invalid())?;
        Ok(Self::Interval(Duration::from_millis(count * scale)))
    }
}

/// Small values kept beside the segments, outside the log itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    CommittedSeq,
    Epoch,
}

impl Checkpoint {
    fn file_name(self) -> &'static str {
        match self {
            Checkpoint::CommittedSeq => "committed_seq",
            Checkpoint::Epoch => "epoch",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    epoch: u64,
    batch_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    seq: u64,
    len: u32,
    crc: u32,
}

impl FrameHeader {
    fn for_payload(seq: u64, payload: &[u8]) -> Self {
        Self {
            seq,
            len: payload.len() as u32,
            crc: crc32fast::hash(payload),
        }
    }

    fn put(&self, buf: &mut impl BufMut) {
        buf.put_slice(MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(0);
        buf.put_u64_le(self.seq);
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.crc);
    }

    /// `None` when the bytes do not start a frame this version wrote
    fn take(buf: &mut impl Buf) -> Option<Self> {
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        let version = buf.get_u8();
        let reserved = buf.get_u8();
        if &magic != MAGIC || version != FORMAT_VERSION || reserved != 0 {
            return None;
        }
        Some(Self {
            seq: buf.get_u64_le(),
            len: buf.get_u32_le(),
            crc: buf.get_u32_le(),
        })
    }
}

/// One intact frame, payload still encoded
#[derive(Debug, Clone)]
struct Frame {
    seq: u64,
    payload: Bytes,
}

impl Frame {
    fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        FrameHeader::for_payload(self.seq, &self.payload).put(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }

    fn decode(&self) -> Result<LogEntry> {
        let mut buf = self.payload.clone();
        if buf.remaining() < 4 {
            return Err(Error::Serialization(format!("WAL entry {} is empty", self.seq)));
        }
        let header_len = buf.get_u32_le() as usize;
        if buf.remaining() < header_len {
            return Err(Error::Serialization(format!(
                "WAL entry {} header overruns its payload",
                self.seq
            )));
        }
        let header: EntryHeader = serde_json::from_slice(&buf.split_to(header_len))?;
        let reader = StreamReader::try_new(buf.reader(), None)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| Error::Serialization(e.to_string()))?;
            rows.extend(batch_to_rows(&batch)?.into_iter().map(|stored| stored.row));
        }
        Ok(LogEntry {
            seq: self.seq,
            epoch: header.epoch,
            batch_id: header.batch_id,
            rows,
        })
    }
}

fn encode_entry(entry: &LogEntry) -> Result<Bytes> {
    let header = serde_json::to_vec(&EntryHeader {
        epoch: entry.epoch,
        batch_id: entry.batch_id.clone(),
    })?;
    let mut out = BytesMut::new().writer();
    out.get_mut().put_u32_le(header.len() as u32);
    out.get_mut().put_slice(&header);

    let batch = rows_to_batch(&entry.rows, entry.seq)?;
    let mut writer = StreamWriter::try_new(&mut out, &batch.schema())
        .map_err(|e| Error::Serialization(e.to_string()))?;
    writer
        .write(&batch)
        .and_then(|_| writer.finish())
        .map_err(|e| Error::Serialization(e.to_string()))?;
    drop(writer);
    Ok(out.into_inner().freeze())
}

#[derive(Debug, Clone)]
struct SegmentFile {
    id: u64,
    path: PathBuf,
}

impl SegmentFile {
    fn name(id: u64) -> String {
        format!("wal-{id:08}.log")
    }

    fn parse(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let id = name.strip_prefix("wal-")?.strip_suffix(".log")?.parse().ok()?;
        Some(Self { id, path })
    }

    /// Intact frames from the start of the file up to the first damaged one
    fn scan(&self) -> Result<Vec<Frame>> {
        let mut buf = Bytes::from(std::fs::read(&self.path).map_err(map_io_error)?);
        let mut frames = Vec::new();
        while buf.has_remaining() {
            if buf.remaining() < HEADER_LEN {
                warn!(segment = ?self.path, after = frames.len(), "Short WAL header, treating as crash point");
                break;
            }
            let Some(header) = FrameHeader::take(&mut buf) else {
                warn!(segment = ?self.path, after = frames.len(), "Unrecognized WAL frame, stopping scan");
                break;
            };
            if buf.remaining() < header.len as usize {
                warn!(segment = ?self.path, seq = header.seq, "Short WAL payload, discarding it");
                break;
            }
            let payload = buf.split_to(header.len as usize);
            if crc32fast::hash(&payload) != header.crc {
                warn!(segment = ?self.path, seq = header.seq, "WAL checksum mismatch, discarding the tail");
                break;
            }
            frames.push(Frame {
                seq: header.seq,
                payload,
            });
        }
        Ok(frames)
    }
}

fn segments_in(dir: &Path) -> Result<Vec<SegmentFile>> {
    let mut segments = std::fs::read_dir(dir)
        .map_err(map_io_error)?
        .map(|entry| entry.map(|e| e.path()).map_err(map_io_error))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter_map(SegmentFile::parse)
        .collect::<Vec<_>>();
    segments.sort_by_key(|s| s.id);
    Ok(segments)
}

async fn open_for_append(path: &Path) -> Result<fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(map_io_error)
}

/// Segmented append-only log of one replica's entries
pub struct WriteAheadLog {
    config: WalConfig,
    active: SegmentFile,
    file: fs::File,
    active_len: u64,
    last_seq: u64,
    synced_at: Instant,
}

impl WriteAheadLog {
    pub async fn open(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.wal_dir)
            .await
            .map_err(map_io_error)?;
        let segments = segments_in(&config.wal_dir)?;

        let mut last_seq = 0;
        for segment in &segments {
            if let Some(frame) = segment.scan()?.last() {
                last_seq = frame.seq;
            }
        }
        let active = segments.last().cloned().unwrap_or_else(|| SegmentFile {
            id: 1,
            path: config.wal_dir.join(SegmentFile::name(1)),
        });
        let file = open_for_append(&active.path).await?;
        let active_len = file.metadata().await.map_err(map_io_error)?.len();
        debug!(wal_dir = ?config.wal_dir, segments = segments.len(), last_seq, "Opened WAL");

        Ok(Self {
            config,
            active,
            file,
            active_len,
            last_seq,
            synced_at: Instant::now(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.wal_dir
    }

    /// Highest logged sequence number, 0 when empty
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Append an entry whose seq is above every logged one
    pub async fn append(&mut self, entry: &LogEntry) -> Result<()> {
        if entry.seq <= self.last_seq {
            return Err(Error::Internal(format!(
                "WAL append out of order: seq {} after {}",
                entry.seq, self.last_seq
            )));
        }
        let frame = Frame {
            seq: entry.seq,
            payload: encode_entry(entry)?,
        };
        let limit = self.config.max_segment_size as u64;
        if limit > 0 && self.active_len > 0 && self.active_len + frame.encoded_len() as u64 > limit {
            self.roll_segment().await?;
        }
        self.write_frame(&frame).await?;

        let due = match self.config.sync_mode {
            WalSyncMode::EveryWrite => true,
            WalSyncMode::Interval(every) => self.synced_at.elapsed() >= every,
            WalSyncMode::OnRotation | WalSyncMode::None => false,
        };
        if due {
            self.sync().await
        } else {
            self.file.flush().await.map_err(map_io_error)
        }
    }

    /// Entries with seq above `after`, in log order
    pub fn read_entries_after(&self, after: u64) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for segment in segments_in(&self.config.wal_dir)? {
            for frame in segment.scan()? {
                if frame.seq > after {
                    entries.push(frame.decode()?);
                }
            }
        }
        Ok(entries)
    }

    /// Delete closed segments holding only entries below `seq`
    pub async fn truncate_before(&mut self, seq: u64) -> Result<()> {
        for segment in segments_in(&self.config.wal_dir)? {
            if segment.id >= self.active.id {
                break;
            }
            let keep = segment.scan()?.last().is_some_and(|f| f.seq >= seq);
            if keep {
                break;
            }
            fs::remove_file(&segment.path).await.map_err(map_io_error)?;
        }
        Ok(())
    }

    /// Drop every entry above `seq`. The kept prefix is copied into a new
    /// segment before the old ones are removed.
    pub async fn truncate_after(&mut self, seq: u64) -> Result<()> {
        if self.last_seq <= seq {
            return Ok(());
        }
        let old = segments_in(&self.config.wal_dir)?;
        let mut kept = Vec::new();
        for segment in &old {
            kept.extend(segment.scan()?.into_iter().filter(|f| f.seq <= seq));
        }

        self.roll_segment().await?;
        self.last_seq = 0;
        for frame in &kept {
            self.write_frame(frame).await?;
        }
        self.sync().await?;
        for segment in old {
            fs::remove_file(&segment.path).await.map_err(map_io_error)?;
        }
        info!(wal_dir = ?self.config.wal_dir, kept_through = self.last_seq, "WAL truncated");
        Ok(())
    }

    /// Atomically replace a checkpoint value
    pub fn store_checkpoint(&self, checkpoint: Checkpoint, value: u64) -> Result<()> {
        let path = self.dir().join(checkpoint.file_name());
        let staged = path.with_extension("tmp");
        std::fs::write(&staged, value.to_string()).map_err(map_io_error)?;
        std::fs::rename(&staged, &path).map_err(map_io_error)
    }

    /// Stored checkpoint value, 0 when never stored
    pub fn load_checkpoint(&self, checkpoint: Checkpoint) -> Result<u64> {
        let path = self.dir().join(checkpoint.file_name());
        match std::fs::read_to_string(&path) {
            Ok(raw) => raw.trim().parse::<u64>().or_else(|_| {
                warn!(checkpoint = checkpoint.file_name(), "Unreadable checkpoint, using 0");
                Ok(0)
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(map_io_error(e)),
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.file
            .write_all(&frame.to_bytes())
            .await
            .map_err(map_io_error)?;
        self.active_len += frame.encoded_len() as u64;
        self.last_seq = frame.seq;
        Ok(())
    }

    async fn roll_segment(&mut self) -> Result<()> {
        if self.config.sync_mode == WalSyncMode::OnRotation {
            self.sync().await?;
        }
        let id = self.active.id + 1;
        self.active = SegmentFile {
            id,
            path: self.config.wal_dir.join(SegmentFile::name(id)),
        };
        self.file = open_for_append(&self.active.path).await?;
        self.active_len = 0;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.file.flush().await.map_err(map_io_error)?;
        self.file.sync_data().await.map_err(map_io_error)?;
        self.synced_at = Instant::now();
        Ok(())
    }
}

fn map_io_error(error: io::Error) -> Error {
    // ENOSPC on Unix, ERROR_DISK_FULL on Windows
    match error.raw_os_error() {
        Some(28) | Some(112) => Error::WalFull,
        _ => Error::Io(error),
    }
}
