use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_WAL_RECORD_BYTES;
use crate::model::Event;

/// Encode a single event as `[len][bincode][crc32]`. Nothing is written on error.
fn encode_event(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n as usize <= MAX_WAL_RECORD_BYTES)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    let crc = crc32fast::hash(&payload);
    let mut record = Vec::with_capacity(payload.len() + 8);
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&crc.to_le_bytes());
    Ok(record)
}

/// Outcome of reading one record during replay.
enum Record {
    /// An intact record and its size on disk.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Torn or corrupt tail; everything from here on is ignored.
    Damaged(&'static str),
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(Record::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_WAL_RECORD_BYTES {
        return Ok(Record::Damaged("implausible record length"));
    }

    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(Record::Damaged("truncated payload"));
    }

    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(Record::Damaged("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Damaged("checksum mismatch"));
    }

    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Record::Event(event, len as u64 + 8)),
        Err(_) => Ok(Record::Damaged("undecodable payload")),
    }
}

/// Every intact record, the byte length they cover, and whether a damaged tail follows.
struct Scan {
    events: Vec<Event>,
    intact_len: u64,
    damaged: bool,
}

fn scan(path: &Path) -> io::Result<Scan> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Scan {
                events: Vec::new(),
                intact_len: 0,
                damaged: false,
            });
        }
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact_len = 0;
    loop {
        match read_record(&mut reader)? {
            Record::Event(event, size) => {
                events.push(event);
                intact_len += size;
            }
            Record::End => {
                return Ok(Scan {
                    events,
                    intact_len,
                    damaged: false,
                });
            }
            Record::Damaged(reason) => {
                tracing::warn!(
                    "WAL {}: damaged tail after {} records ({reason})",
                    path.display(),
                    events.len()
                );
                return Ok(Scan {
                    events,
                    intact_len,
                    damaged: true,
                });
            }
        }
    }
}

/// Append-only write-ahead log for one tenant.
///
/// Format per record: `[u32: len][bincode: Event][u32: crc32]`.
/// A creation request is a single record, so a crash mid-write loses the whole
/// request on replay, never part of a series.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Bytes known to be on disk after the last successful `flush_sync`.
    synced_len: u64,
    /// Records buffered since then.
    pending: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path` for appends.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            pending: 0,
            appends_since_compact: 0,
        })
    }

    /// Replay the log and cut off any damaged tail, so later appends land
    /// directly after the last intact record. Returns the intact events.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let scan = scan(path)?;
        if scan.damaged {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.intact_len)?;
            file.sync_all()?;
            tracing::warn!(
                "WAL {}: truncated to {} bytes",
                path.display(),
                scan.intact_len
            );
        }
        Ok(scan.events)
    }

    /// Append and fsync one event. Production code goes through the group-commit
    /// writer instead (`append_buffered` + `flush_sync`).
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without flushing. Call `flush_sync()` after the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        let record = encode_event(event)?;
        self.writer.write_all(&record)?;
        self.pending += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.pending = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`,
    /// buffered or already partially written.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let (stale, _discarded) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        drop(stale);
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending);
        self.pending = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to `<path>.tmp` and fsync it. This is the slow phase.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            writer.write_all(&encode_event(event)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact record without touching the file. A damaged tail is logged and dropped.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(scan(path)?.events)
    }
}
