//! Durable file-backed transaction log.
//!
//! Record layout (little-endian):
//! ┌────────────┬────────────┬───────────┐
//! │ u32 len    │ u32 crc32  │ payload…  │
//! └────────────┴────────────┴───────────┘
//! - `len`   : number of bytes in payload
//! - `crc32` : checksum of payload for corruption detection
//!
//! Payloads are postcard-encoded [`LogRecord`]s. Every append is flushed and
//! synced before the SID is returned; a torn record at the tail (a crash
//! mid-write) is treated as the end of the log, while a checksum mismatch on
//! an intact record is surfaced as corruption.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crc32fast::Hasher;
use tempo_common::{Key, Tid, TxnState, Xid};

use super::{LogOp, LogRecord, TransactionLog};
use crate::error::{EngineResult, LogError};

const HEADER_SIZE: usize = 8;

pub struct FileLog<K: Key> {
    writer: Mutex<BufWriter<File>>,
    next_sid: AtomicU64,
    path: PathBuf,
    _marker: PhantomData<fn() -> K>,
}

impl<K: Key> FileLog<K> {
    /// Open an existing log or create a new one at `path`. The next SID
    /// continues after the highest SID already on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(LogError::Io)?;
        }

        let existing = read_records::<K>(&path)?;
        let next_sid = existing.iter().map(|r| r.sid).max().map_or(1, |max| max + 1);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(LogError::Io)?;
        file.seek(SeekFrom::End(0)).map_err(LogError::Io)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            next_sid: AtomicU64::new(next_sid),
            path,
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record: assign the SID, frame, write, flush and sync. A
    /// failed write truncates the file back to its pre-append length so no
    /// partial record is left behind the write position.
    fn append_op(&self, tid: Tid, op: LogOp<K>) -> EngineResult<u64> {
        let mut writer = self.writer.lock().unwrap();
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord { sid, tid, op };

        let payload = postcard::to_stdvec(&record)
            .map_err(|e| LogError::SerializationFailed(e.to_string()))?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let original_pos = writer.stream_position().map_err(LogError::Io)?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&checksum.to_le_bytes());
        data.extend_from_slice(&payload);

        if let Err(e) = writer.write_all(&data) {
            writer.seek(SeekFrom::Start(original_pos)).map_err(LogError::Io)?;
            writer.get_ref().set_len(original_pos).map_err(LogError::Io)?;
            return Err(LogError::Io(e).into());
        }

        writer.flush().map_err(LogError::Io)?;
        writer.get_ref().sync_data().map_err(LogError::Io)?;
        Ok(sid)
    }
}

impl<K: Key> TransactionLog<K> for FileLog<K> {
    fn append_state_transition(&self, tid: Tid, state: TxnState) -> EngineResult<u64> {
        self.append_op(tid, LogOp::StateTransition { state })
    }

    fn append_xa_state_transition(&self, xid: Xid, state: TxnState) -> EngineResult<u64> {
        self.append_op(xid.tid(), LogOp::XaStateTransition { pid: xid.pid(), state })
    }

    fn append_get(&self, tid: Tid, key: &K, version: u64) -> EngineResult<u64> {
        self.append_op(tid, LogOp::Get { key: key.clone(), version })
    }

    fn append_put(&self, tid: Tid, key: &K) -> EngineResult<u64> {
        self.append_op(tid, LogOp::Put { key: key.clone() })
    }

    fn append_delete(&self, tid: Tid, key: &K) -> EngineResult<u64> {
        self.append_op(tid, LogOp::Delete { key: key.clone() })
    }

    /// Discard all records with SID <= `sid` by rewriting the live suffix
    /// into a fresh file.
    fn truncate(&self, sid: u64) -> EngineResult<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.flush().map_err(LogError::Io)?;

        let retained: Vec<LogRecord<K>> = read_records(&self.path)?
            .into_iter()
            .filter(|record| record.sid > sid)
            .collect();

        fs::remove_file(&self.path).map_err(LogError::Io)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(LogError::Io)?;

        for record in &retained {
            let payload = postcard::to_stdvec(record)
                .map_err(|e| LogError::SerializationFailed(e.to_string()))?;
            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let checksum = hasher.finalize();
            file.write_all(&(payload.len() as u32).to_le_bytes())
                .map_err(LogError::Io)?;
            file.write_all(&checksum.to_le_bytes()).map_err(LogError::Io)?;
            file.write_all(&payload).map_err(LogError::Io)?;
        }
        file.sync_data().map_err(LogError::Io)?;
        file.seek(SeekFrom::End(0)).map_err(LogError::Io)?;

        *writer = BufWriter::new(file);
        Ok(())
    }

    fn recover(&self) -> EngineResult<Box<dyn Iterator<Item = LogRecord<K>> + Send>> {
        self.writer.lock().unwrap().flush().map_err(LogError::Io)?;
        let mut records = read_records::<K>(&self.path)?;
        records.sort_by_key(|record| record.sid);
        Ok(Box::new(records.into_iter()))
    }
}

/// Read every intact record in file order. A clean or torn end-of-file stops
/// iteration; a checksum mismatch on a complete record is corruption.
fn read_records<K: Key>(path: &Path) -> EngineResult<Vec<LogRecord<K>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LogError::Io(e).into()),
    };

    let mut records = Vec::new();
    let mut header = [0u8; HEADER_SIZE];
    loop {
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(LogError::Io(e).into()),
        }
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());

        let mut payload = vec![0u8; len];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            // Torn tail: the crash happened mid-append, the record was never
            // acknowledged.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(LogError::Io(e).into()),
        }

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != checksum {
            return Err(LogError::ChecksumMismatch.into());
        }

        let record = postcard::from_bytes(&payload)
            .map_err(|e| LogError::DeserializationFailed(e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}
