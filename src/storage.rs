// Persistent storage for Raft state
//
// Two files live in the data directory:
//
// - raft_state.dat (fixed 28 bytes):
//     | magic(4) | version(4) | crc32(4) | current_term(8) | voted_for(4) | pad(4) |
//   the CRC covers the current_term + voted_for region and the whole file
//   is replaced atomically on every save.
//
// - raft_log.dat: a 24-byte header
//     | magic(4) | version(4) | base_index(8) | base_term(8) |
//   followed by append-only records
//     | record_len(4) | crc32(4) | term(8) | index(8) | kind(1) | cmd_len(4) | payload |
//   the CRC covers term + index + kind + cmd_len + payload.
//
// All integers little-endian. voted_for is stored as i32 with -1 for "none".

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};

use crate::error::{RaftError, Result};
use crate::types::{EntryKind, LogEntry, LogIndex, NodeId, Term};

pub const STATE_MAGIC: u32 = 0x5241_4654; // "RAFT"
pub const LOG_MAGIC: u32 = 0x524C_4F47; // "RLOG"
pub const STORAGE_VERSION: u32 = 1;

pub const STATE_FILE_NAME: &str = "raft_state.dat";
pub const LOG_FILE_NAME: &str = "raft_log.dat";
const TEMP_SUFFIX: &str = ".tmp";

const STATE_FILE_LEN: usize = 28;
const LOG_HEADER_LEN: usize = 24;
/// record_len + crc32 + term + index + kind + cmd_len
const RECORD_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 1 + 4;

/// Handle on a node's durable files. Owned exclusively by one node.
#[derive(Debug)]
pub struct Storage {
    dir: PathBuf,
    sync_writes: bool,
    log_file: File,
    entry_count: u64,
}

impl Storage {
    /// Open (creating if necessary) the storage files under `dir`.
    pub fn open(dir: &Path, sync_writes: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let log_path = dir.join(LOG_FILE_NAME);
        let mut log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&log_path)?;

        // fresh file: stamp the header
        if log_file.metadata()?.len() == 0 {
            let mut header = Vec::with_capacity(LOG_HEADER_LEN);
            header.put_u32_le(LOG_MAGIC);
            header.put_u32_le(STORAGE_VERSION);
            header.put_u64_le(0); // base_index
            header.put_u64_le(0); // base_term
            log_file.write_all(&header)?;
            if sync_writes {
                log_file.sync_all()?;
            }
        }

        let mut storage = Self {
            dir: dir.to_path_buf(),
            sync_writes,
            log_file,
            entry_count: 0,
        };
        storage.entry_count = storage.count_records()?;
        Ok(storage)
    }

    /// Durably record current_term and voted_for. Must complete before any
    /// RPC reply that depends on them is released.
    pub fn save_state(&self, current_term: Term, voted_for: Option<NodeId>) -> Result<()> {
        let mut buf = Vec::with_capacity(STATE_FILE_LEN);
        buf.put_u32_le(STATE_MAGIC);
        buf.put_u32_le(STORAGE_VERSION);

        let mut covered = Vec::with_capacity(12);
        covered.put_u64_le(current_term);
        covered.put_i32_le(voted_for.map_or(-1, |id| id as i32));

        buf.put_u32_le(crc32fast::hash(&covered));
        buf.put_slice(&covered);
        buf.put_u32_le(0); // padding

        write_file_atomic(&self.dir.join(STATE_FILE_NAME), &buf, self.sync_writes)
    }

    /// Load current_term and voted_for. `NotFound` if no state was ever
    /// saved; `Corruption` on any magic/version/CRC mismatch.
    pub fn load_state(&self) -> Result<(Term, Option<NodeId>)> {
        let path = self.dir.join(STATE_FILE_NAME);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RaftError::NotFound("no state file".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if data.len() < STATE_FILE_LEN {
            return Err(RaftError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short state file",
            )));
        }

        let mut buf = &data[..];
        let magic = buf.get_u32_le();
        let version = buf.get_u32_le();
        let crc = buf.get_u32_le();
        if magic != STATE_MAGIC {
            return Err(RaftError::Corruption("state file magic mismatch".into()));
        }
        if version != STORAGE_VERSION {
            return Err(RaftError::Corruption(format!(
                "unsupported state file version {version}"
            )));
        }
        if crc32fast::hash(&data[12..24]) != crc {
            return Err(RaftError::Corruption("state file CRC mismatch".into()));
        }

        let current_term = buf.get_u64_le();
        let voted_for = buf.get_i32_le();
        let voted_for = if voted_for < 0 {
            None
        } else {
            Some(voted_for as NodeId)
        };
        Ok((current_term, voted_for))
    }

    /// Append one entry to the durable log.
    pub fn append_entry(&mut self, entry: &LogEntry) -> Result<()> {
        self.log_file.seek(SeekFrom::End(0))?;

        let record = encode_record(entry);
        self.log_file.write_all(&record)?;
        if self.sync_writes {
            self.log_file.sync_all()?;
        }
        self.entry_count += 1;
        Ok(())
    }

    /// Drop every record with index > `after` by truncating the file after
    /// the last surviving record.
    pub fn truncate_log(&mut self, after: LogIndex) -> Result<()> {
        self.log_file.seek(SeekFrom::Start(LOG_HEADER_LEN as u64))?;

        let mut keep_end = LOG_HEADER_LEN as u64;
        let mut kept = 0u64;
        while let Some(record) = self.read_record_header()? {
            if record.index > after {
                break;
            }
            self.log_file
                .seek(SeekFrom::Current(i64::from(record.cmd_len)))?;
            keep_end = self.log_file.stream_position()?;
            kept += 1;
        }

        self.log_file.set_len(keep_end)?;
        if self.sync_writes {
            self.log_file.sync_all()?;
        }
        self.entry_count = kept;
        Ok(())
    }

    /// Atomically replace the whole log file: new header anchor plus the
    /// given entries. Used after compaction and snapshot installation.
    pub fn rewrite_log(
        &mut self,
        base_index: LogIndex,
        base_term: Term,
        entries: &[LogEntry],
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(LOG_HEADER_LEN + entries.len() * 64);
        buf.put_u32_le(LOG_MAGIC);
        buf.put_u32_le(STORAGE_VERSION);
        buf.put_u64_le(base_index);
        buf.put_u64_le(base_term);
        for entry in entries {
            buf.put_slice(&encode_record(entry));
        }

        let path = self.dir.join(LOG_FILE_NAME);
        write_file_atomic(&path, &buf, self.sync_writes)?;

        // the old handle points at the replaced inode
        self.log_file = OpenOptions::new().read(true).write(true).open(&path)?;
        self.entry_count = entries.len() as u64;
        Ok(())
    }

    /// Replay every record in order, validating CRCs. A partial record at
    /// the tail or any checksum mismatch is `Corruption`.
    pub fn iterate_log<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(Term, LogIndex, EntryKind, &[u8]) -> Result<()>,
    {
        self.log_file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; LOG_HEADER_LEN];
        self.log_file.read_exact(&mut header).map_err(short_log)?;
        let mut buf = &header[..];
        if buf.get_u32_le() != LOG_MAGIC {
            return Err(RaftError::Corruption("log file magic mismatch".into()));
        }
        if buf.get_u32_le() != STORAGE_VERSION {
            return Err(RaftError::Corruption("unsupported log file version".into()));
        }

        let mut payload = Vec::new();
        while let Some(record) = self.read_record_header()? {
            payload.resize(record.cmd_len as usize, 0);
            self.log_file.read_exact(&mut payload).map_err(short_log)?;

            let mut covered = Vec::with_capacity(RECORD_HEADER_LEN - 8 + payload.len());
            covered.put_u64_le(record.term);
            covered.put_u64_le(record.index);
            covered.put_u8(record.kind_raw);
            covered.put_u32_le(record.cmd_len);
            covered.put_slice(&payload);
            if crc32fast::hash(&covered) != record.crc {
                return Err(RaftError::Corruption(format!(
                    "log record CRC mismatch at index {}",
                    record.index
                )));
            }

            let kind = EntryKind::from_u8(record.kind_raw).ok_or_else(|| {
                RaftError::Corruption(format!(
                    "unknown entry kind {} at index {}",
                    record.kind_raw, record.index
                ))
            })?;
            f(record.term, record.index, kind, &payload)?;
        }
        Ok(())
    }

    /// The log file's anchor and record count.
    pub fn get_log_info(&mut self) -> Result<(LogIndex, Term, u64)> {
        self.log_file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; LOG_HEADER_LEN];
        self.log_file.read_exact(&mut header).map_err(short_log)?;
        let mut buf = &header[..];
        if buf.get_u32_le() != LOG_MAGIC {
            return Err(RaftError::Corruption("log file magic mismatch".into()));
        }
        buf.get_u32_le(); // version
        let base_index = buf.get_u64_le();
        let base_term = buf.get_u64_le();
        Ok((base_index, base_term, self.entry_count))
    }

    /// Flush pending log writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.log_file.sync_all()?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn count_records(&mut self) -> Result<u64> {
        self.log_file.seek(SeekFrom::Start(LOG_HEADER_LEN as u64))?;
        let mut count = 0;
        while let Some(record) = self.read_record_header()? {
            self.log_file
                .seek(SeekFrom::Current(i64::from(record.cmd_len)))?;
            count += 1;
        }
        Ok(count)
    }

    /// Read the fixed part of the record at the current position. `None`
    /// at a clean end of file; `Corruption` on a partial record.
    fn read_record_header(&mut self) -> Result<Option<RecordHeader>> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        let mut read = 0;
        while read < header.len() {
            match self.log_file.read(&mut header[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if read == 0 {
            return Ok(None);
        }
        if read < header.len() {
            return Err(RaftError::Corruption("truncated log record".into()));
        }

        let mut buf = &header[..];
        let record_len = buf.get_u32_le();
        let crc = buf.get_u32_le();
        let term = buf.get_u64_le();
        let index = buf.get_u64_le();
        let kind_raw = buf.get_u8();
        let cmd_len = buf.get_u32_le();
        if record_len as usize != RECORD_HEADER_LEN + cmd_len as usize {
            return Err(RaftError::Corruption(format!(
                "log record length mismatch at index {index}"
            )));
        }
        Ok(Some(RecordHeader {
            crc,
            term,
            index,
            kind_raw,
            cmd_len,
        }))
    }
}

struct RecordHeader {
    crc: u32,
    term: Term,
    index: LogIndex,
    kind_raw: u8,
    cmd_len: u32,
}

fn encode_record(entry: &LogEntry) -> Vec<u8> {
    let mut covered = Vec::with_capacity(21 + entry.data.len());
    covered.put_u64_le(entry.term);
    covered.put_u64_le(entry.index);
    covered.put_u8(entry.kind.as_u8());
    covered.put_u32_le(entry.data.len() as u32);
    covered.put_slice(&entry.data);

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + entry.data.len());
    record.put_u32_le((RECORD_HEADER_LEN + entry.data.len()) as u32);
    record.put_u32_le(crc32fast::hash(&covered));
    record.put_slice(&covered);
    record
}

fn short_log(e: io::Error) -> RaftError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RaftError::Corruption("truncated log record".into())
    } else {
        RaftError::Io(e)
    }
}

/// Write `data` to `path` via a temp file renamed into place, optionally
/// fsyncing before the rename.
pub(crate) fn write_file_atomic(path: &Path, data: &[u8], sync: bool) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TEMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    if sync {
        file.sync_all()?;
    }
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}
