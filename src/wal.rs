use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one committed unit of work to [len][bincode][crc32] format.
fn encode_frame(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per frame: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - One frame is one committed unit of work; its events are replayed together or not at all.
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last frame (crash) is safely discarded via length-prefix + CRC check.
/// - A failed batch is cut back to the last synced length before anything else
///   is appended, so a torn frame never hides later frames from replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length and append count as of the last successful `flush_sync`.
    synced_len: u64,
    synced_appends: u64,
    /// Set when a rollback failed; the file tail is unknown so nothing more is written.
    poisoned: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            synced_appends: 0,
            poisoned: false,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Append a single frame and fsync. The writer task uses
    /// `append_buffered` + `flush_sync` for group commit instead.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Append a frame to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered frames.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL unusable after failed rollback"));
        }
        encode_frame(&mut self.writer, events)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        {
            if std::mem::take(&mut self.fail_next_sync) {
                return Err(io::Error::other("injected sync failure"));
            }
        }
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.synced_appends = self.appends_since_compact;
        Ok(())
    }

    /// Discard everything written since the last successful `flush_sync`,
    /// buffered or on disk. Poisons the log if the file can't be cut back.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.truncate_to_synced();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // into_parts drops the old buffer without writing it out
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = old.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.synced_appends;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_sync(&mut self) {
        self.fail_next_sync = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted state to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        if !events.is_empty() {
            encode_frame(&mut writer, events)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.synced_appends = 0;
        // Rewritten from in-memory state, so the tail is known again
        self.poisoned = false;
        Ok(())
    }

    /// Both compaction phases at once. Used by tests.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning the events of every intact frame in order.
    /// A truncated or corrupt frame ends the replay; nothing after it is applied.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(frame) => events.extend(frame),
                Err(_) => break,
            }
        }

        Ok(events)
    }
}
