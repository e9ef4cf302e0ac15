//! Durable append-only message log.

use super::MessageStore;
use crate::error::{StoreError, StoreResult};
use crate::types::{AuthorId, Message, MessageId, NewMessage, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the log file header.
const LOG_MAGIC: &[u8; 4] = b"CHF\0";

/// Magic bytes for each record.
const RECORD_MAGIC: &[u8; 4] = b"MSG\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header size: magic + version + high-water mark.
const HEADER_SIZE: u64 = 4 + 1 + 8;

/// Offset of the high-water mark inside the header.
const HIGH_WATER_OFFSET: u64 = 5;

/// Log configuration.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Path to the log file. A `.lock` sibling guards exclusive access.
    pub path: PathBuf,

    /// Sync every N appends (0 and 1 both mean every append).
    pub sync_interval: u64,

    /// Whether to create the log if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./messages.log"),
            sync_interval: 100,
            create_if_missing: true,
        }
    }
}

/// On-disk body of a record. Id and timestamp live in the fixed header.
#[derive(Serialize, Deserialize)]
struct StoredBody {
    author_id: AuthorId,
    display_name: String,
    body: String,
}

struct LogState {
    file: File,
    /// (id, offset) ascending by id.
    offsets: Vec<(MessageId, u64)>,
    file_size: u64,
    high_water: MessageId,
    writes_since_sync: u64,
}

/// File-backed message log.
///
/// Records are framed as `magic | id | created_at | len | body | crc32`,
/// with the body MessagePack-encoded. The id→offset index is kept in
/// memory and rebuilt by scanning on open.
pub struct MessageLog {
    path: PathBuf,
    _lock_file: File,
    state: Mutex<LogState>,
    sync_interval: u64,
}

impl MessageLog {
    /// Open an existing log or create a new one.
    pub fn open(config: LogConfig) -> StoreResult<Self> {
        let exists = config.path.exists();
        if !exists && !config.create_if_missing {
            return Err(StoreError::NotInitialized);
        }

        let lock_file = Self::acquire_lock(&config.path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;

        let state = if file.metadata()?.len() == 0 {
            Self::write_header(&mut file, MessageId::ZERO)?;
            file.sync_all()?;
            LogState {
                file,
                offsets: Vec::new(),
                file_size: HEADER_SIZE,
                high_water: MessageId::ZERO,
                writes_since_sync: 0,
            }
        } else {
            Self::recover(file)?
        };

        tracing::debug!(
            path = %config.path.display(),
            messages = state.offsets.len(),
            high_water = %state.high_water,
            "Message log opened"
        );

        Ok(Self {
            path: config.path,
            _lock_file: lock_file,
            state: Mutex::new(state),
            sync_interval: config.sync_interval.max(1),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.state.lock().file_size
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.file.sync_all()?;
        state.writes_since_sync = 0;
        Ok(())
    }

    fn acquire_lock(path: &Path) -> StoreResult<File> {
        let lock_path = path.with_extension("lock");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }

    fn write_header(file: &mut File, high_water: MessageId) -> StoreResult<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.write_all(&high_water.0.to_le_bytes())?;
        Ok(())
    }

    /// Verify the header and rebuild the index. A torn record at the tail
    /// (crash mid-append) is cut off; anything else malformed is an error.
    fn recover(mut file: File) -> StoreResult<LogState> {
        file.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid log magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        let mut hw_bytes = [0u8; 8];
        file.read_exact(&mut hw_bytes)?;
        let mut high_water = MessageId(u64::from_le_bytes(hw_bytes));

        let file_len = file.metadata()?.len();
        let mut offsets = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset < file_len {
            match Self::read_record(&mut file) {
                Ok(message) => {
                    if message.id <= high_water {
                        return Err(StoreError::Corruption(format!(
                            "Non-increasing id {} at offset {}",
                            message.id, offset
                        )));
                    }
                    high_water = high_water.max(message.id);
                    offsets.push((message.id, offset));
                    offset = file.stream_position()?;
                }
                Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(offset, file_len, "Discarding torn record at log tail");
                    file.set_len(offset)?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(LogState {
            file,
            offsets,
            file_size: offset,
            high_water,
            writes_since_sync: 0,
        })
    }

    /// Append one framed record at the current position. Returns its length.
    fn write_record(file: &mut File, message: &Message) -> StoreResult<u64> {
        let body = rmp_serde::to_vec(&StoredBody {
            author_id: message.author_id,
            display_name: message.display_name.clone(),
            body: message.body.clone(),
        })?;

        let id_bytes = message.id.0.to_le_bytes();
        let ts_bytes = message.created_at.0.to_le_bytes();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&id_bytes);
        hasher.update(&ts_bytes);
        hasher.update(&body);
        let checksum = hasher.finalize();

        let mut buf = Vec::with_capacity(4 + 8 + 8 + 4 + body.len() + 4);
        buf.extend_from_slice(RECORD_MAGIC);
        buf.extend_from_slice(&id_bytes);
        buf.extend_from_slice(&ts_bytes);
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&checksum.to_le_bytes());

        file.write_all(&buf)?;
        Ok(buf.len() as u64)
    }

    /// Cut the file back to `offset` after a failed append.
    fn roll_back(file: &mut File, offset: u64) {
        if let Err(e) = file.set_len(offset) {
            // The next append overwrites from `offset`; a longer leftover
            // would surface as a bad record on reopen.
            tracing::error!(offset, error = %e, "Failed to roll back partial record");
        }
    }

    /// Read a record from the file at current position.
    fn read_record(file: &mut File) -> StoreResult<Message> {
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != RECORD_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid record magic".into()));
        }

        let mut id_bytes = [0u8; 8];
        file.read_exact(&mut id_bytes)?;

        let mut ts_bytes = [0u8; 8];
        file.read_exact(&mut ts_bytes)?;

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut body = vec![0u8; len];
        file.read_exact(&mut body)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&id_bytes);
        hasher.update(&ts_bytes);
        hasher.update(&body);
        let computed = hasher.finalize();

        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let decoded: StoredBody = rmp_serde::from_slice(&body)?;

        Ok(Message {
            id: MessageId(u64::from_le_bytes(id_bytes)),
            author_id: decoded.author_id,
            display_name: decoded.display_name,
            body: decoded.body,
            created_at: Timestamp(i64::from_le_bytes(ts_bytes)),
        })
    }

    fn read_at(file: &mut File, offset: u64) -> StoreResult<Message> {
        file.seek(SeekFrom::Start(offset))?;
        Self::read_record(file)
    }

    fn read_many<'a>(
        file: &mut File,
        entries: impl Iterator<Item = &'a (MessageId, u64)>,
    ) -> StoreResult<Vec<Message>> {
        entries
            .map(|&(_, offset)| Self::read_at(file, offset))
            .collect()
    }
}

impl MessageStore for MessageLog {
    fn append(&self, input: NewMessage) -> StoreResult<(Message, MessageId)> {
        let mut state = self.state.lock();

        let previous = state
            .offsets
            .last()
            .map(|&(id, _)| id)
            .unwrap_or(MessageId::ZERO);
        let id = state.high_water.next();
        let message = input.into_message(id, Timestamp::now());

        let offset = state.file_size;
        let sync_due = state.writes_since_sync + 1 >= self.sync_interval;

        // Nothing is published to the index until the record is written
        // and, when due, synced.
        let written = state
            .file
            .seek(SeekFrom::Start(offset))
            .map_err(StoreError::from)
            .and_then(|_| Self::write_record(&mut state.file, &message))
            .and_then(|len| {
                if sync_due {
                    state.file.sync_all()?;
                }
                Ok(len)
            });

        let len = match written {
            Ok(len) => len,
            Err(e) => {
                Self::roll_back(&mut state.file, offset);
                return Err(e);
            }
        };

        state.file_size = offset + len;
        state.offsets.push((id, offset));
        state.high_water = id;
        state.writes_since_sync = if sync_due {
            0
        } else {
            state.writes_since_sync + 1
        };

        Ok((message, previous))
    }

    fn query_after(&self, cursor: MessageId, limit: Option<usize>) -> StoreResult<Vec<Message>> {
        let mut state = self.state.lock();
        let start = state.offsets.partition_point(|&(id, _)| id <= cursor);
        let available = state.offsets.len() - start;
        let take = limit.unwrap_or(available).min(available);

        let LogState { file, offsets, .. } = &mut *state;
        Self::read_many(file, offsets[start..start + take].iter())
    }

    fn recent(&self, limit: usize) -> StoreResult<Vec<Message>> {
        self.page(0, limit)
    }

    fn page(&self, page: usize, size: usize) -> StoreResult<Vec<Message>> {
        let mut state = self.state.lock();
        let LogState { file, offsets, .. } = &mut *state;
        Self::read_many(
            file,
            offsets.iter().rev().skip(page.saturating_mul(size)).take(size),
        )
    }

    fn last_id(&self) -> MessageId {
        self.state.lock().high_water
    }

    fn len(&self) -> usize {
        self.state.lock().offsets.len()
    }

    fn truncate(&self) -> StoreResult<MessageId> {
        let mut state = self.state.lock();
        let high_water = state.high_water;

        state.file.set_len(HEADER_SIZE)?;
        state.file.seek(SeekFrom::Start(HIGH_WATER_OFFSET))?;
        state.file.write_all(&high_water.0.to_le_bytes())?;
        state.file.sync_all()?;

        state.offsets.clear();
        state.file_size = HEADER_SIZE;
        state.writes_since_sync = 0;

        tracing::info!(high_water = %high_water, "Message log truncated");
        Ok(high_water)
    }
}

impl Drop for MessageLog {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
