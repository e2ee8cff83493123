use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

/// Frame one event as `[u32 len][bincode payload][u32 crc32]`. Returns the
/// number of bytes written.
fn encode_frame(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Read one frame and its size on disk. `Ok(None)` means a clean end of
/// file or a damaged tail.
fn decode_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    let mut payload = vec![0u8; len as usize];
    let mut crc_buf = [0u8; 4];
    for buf in [payload.as_mut_slice(), crc_buf.as_mut_slice()] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!("wal: discarding truncated trailing entry");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        warn!("wal: checksum mismatch, discarding tail");
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, 8 + u64::from(len)))),
        Err(e) => {
            warn!("wal: undecodable entry ({e}), discarding tail");
            Ok(None)
        }
    }
}

/// Every intact event and the length of the intact prefix.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0;
    while let Some((event, size)) = decode_frame(&mut reader)? {
        events.push(event);
        valid_len += size;
    }
    Ok((events, valid_len))
}

/// Append-only log of inventory events.
///
/// Entries are length-prefixed and checksummed so a torn final write after a
/// crash is dropped on replay instead of poisoning the store. A batch that
/// fails to stage or sync is cut back off the file, so the log only ever
/// holds events whose callers were told they are durable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length as of the last successful sync.
    durable_len: u64,
    staged_appends: u64,
    appends_since_compact: u64,
    /// Set after a failed write until a rollback succeeds.
    poisoned: bool,
}

impl Wal {
    fn with_file(file: File, path: &Path, durable_len: u64) -> Self {
        Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len,
            staged_appends: 0,
            appends_since_compact: 0,
            poisoned: false,
        }
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Replay the log, cut any damaged tail so new frames follow the last
    /// intact one, and open it for appends.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = scan(path)?;
        let file = Self::open_append(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!("wal: truncating {} damaged bytes", on_disk - valid_len);
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::with_file(file, path, valid_len), events))
    }

    #[cfg(test)]
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::recover(path)?.0)
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.commit_batch(std::iter::once(event))
    }

    /// Stage and sync a group of events with one fsync. On any failure the
    /// whole group is rolled back off the file.
    pub fn commit_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        let result = events
            .into_iter()
            .try_for_each(|event| self.stage(event))
            .and_then(|()| self.sync());
        if let Err(e) = result {
            if let Err(rollback) = self.rollback() {
                error!("wal: rollback after failed write also failed: {rollback}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Buffer an event without flushing. A group of staged events becomes
    /// durable with one `sync()`.
    pub fn stage(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            self.rollback()?;
        }
        if let Err(e) = encode_frame(&mut self.writer, event) {
            self.poisoned = true;
            return Err(e);
        }
        self.staged_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered frames and fsync the file.
    pub fn sync(&mut self) -> io::Result<()> {
        let synced = self
            .writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_all())
            .and_then(|()| self.writer.get_ref().metadata());
        match synced {
            Ok(meta) => {
                self.durable_len = meta.len();
                self.staged_appends = 0;
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Drop everything staged since the last successful sync, both the
    /// buffered bytes and whatever already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.poisoned = true;
        let fresh = BufWriter::new(Self::open_append(&self.path)?);
        // `into_parts` hands back the old file without flushing the buffer.
        let (old, _unflushed) = std::mem::replace(&mut self.writer, fresh).into_parts();
        drop(old);
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.staged_appends);
        self.staged_appends = 0;
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.poisoned = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn snapshot_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a compacted event set next to the log. Slow; runs before the swap.
    pub fn write_snapshot(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::snapshot_path(path))?);
        for event in events {
            encode_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen it for appends.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        fs::rename(Self::snapshot_path(&self.path), &self.path)?;
        let file = Self::open_append(&self.path)?;
        let len = file.metadata()?.len();
        let path = self.path.clone();
        *self = Self::with_file(file, &path, len);
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_snapshot(&self.path, events)?;
        self.install_snapshot()
    }

    /// Read every intact event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(scan(path)?.0)
    }
}
