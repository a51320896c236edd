use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Write one `[len][bincode][crc32]` frame.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Events recovered from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// A torn or corrupt tail was found and skipped.
    pub discarded_tail: bool,
}

/// Sink under a `Wal`: a file that can be synced and cut back.
pub trait JournalFile: Write + Send {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl JournalFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append-only booking journal.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// `len` covers the payload only. A truncated or corrupt entry ends replay;
/// everything before it is kept.
///
/// Appends are staged in memory and reach the file only in `flush_sync`. A
/// failed flush cuts the file back to the last synced length, so events whose
/// writers were told "failed" never resurface on replay.
pub struct Wal<F: JournalFile = File> {
    file: F,
    path: PathBuf,
    staged: Vec<u8>,
    staged_events: u64,
    synced_len: u64,
    /// Set when a failed flush could not be rolled back.
    poisoned: bool,
    appends_since_compact: u64,
}

impl Wal<File> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::with_file(file, path, len))
    }
}

impl<F: JournalFile> Wal<F> {
    pub(crate) fn with_file(file: F, path: &Path, synced_len: u64) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            staged: Vec::new(),
            staged_events: 0,
            synced_len,
            poisoned: false,
            appends_since_compact: 0,
        }
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage an event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.check_usable()?;
        let mark = self.staged.len();
        if let Err(e) = write_frame(&mut self.staged, event) {
            self.staged.truncate(mark);
            return Err(e);
        }
        self.staged_events += 1;
        Ok(())
    }

    /// Drop every staged event without writing it.
    pub fn discard_staged(&mut self) {
        self.staged.clear();
        self.staged_events = 0;
    }

    /// Write and fsync staged events. On failure nothing staged survives,
    /// on disk or in memory.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_usable()?;
        if self.staged.is_empty() {
            return Ok(());
        }
        let written = self
            .file
            .write_all(&self.staged)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync());
        let staged_len = self.staged.len() as u64;
        let staged_events = self.staged_events;
        self.discard_staged();

        match written {
            Ok(()) => {
                self.synced_len += staged_len;
                self.appends_since_compact += staged_events;
                Ok(())
            }
            Err(e) => {
                if let Err(cut) = self
                    .file
                    .truncate(self.synced_len)
                    .and_then(|()| self.file.sync())
                {
                    self.poisoned = true;
                    return Err(io::Error::other(format!(
                        "{e}; rollback to {} bytes failed: {cut}",
                        self.synced_len
                    )));
                }
                Err(e)
            }
        }
    }

    fn check_usable(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(format!(
                "journal {} is poisoned after a failed rollback",
                self.path.display()
            )));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn file_mut(&mut self) -> &mut F {
        &mut self.file
    }

    pub fn synced_len(&self) -> u64 {
        self.synced_len
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

impl Wal<File> {
    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Replace the journal with `events`: write a synced temp file, then
    /// rename it over the live file and reopen for appends.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = Self::compact_path(&self.path);
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_frame(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        self.flush_sync()?;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let len = file.metadata()?.len();
        let path = self.path.clone();
        *self = Self::with_file(file, &path, len);
        Ok(())
    }

    /// Read every intact event. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            let mut first = [0u8; 1];
            // Clean end of file: no partial header.
            if !read_or_eof(&mut reader, &mut first)? {
                break;
            }
            len_buf[0] = first[0];
            if !read_or_eof(&mut reader, &mut len_buf[1..])? {
                replay.discarded_tail = true;
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            if !read_or_eof(&mut reader, &mut payload)? || !read_or_eof(&mut reader, &mut crc_buf)? {
                replay.discarded_tail = true;
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                replay.discarded_tail = true;
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => replay.events.push(event),
                Err(_) => {
                    replay.discarded_tail = true;
                    break;
                }
            }
        }

        Ok(replay)
    }
}

#[cfg(test)]
/// File that can be told to fail writes partway through.
pub(crate) struct FlakyFile {
    inner: File,
    pub fail_writes: bool,
    pub fail_truncate: bool,
}

#[cfg(test)]
impl FlakyFile {
    pub fn open(path: &Path) -> Self {
        let inner = OpenOptions::new().create(true).append(true).open(path).unwrap();
        Self {
            inner,
            fail_writes: false,
            fail_truncate: false,
        }
    }
}

#[cfg(test)]
impl Write for FlakyFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            // Half the buffer lands before the device gives up.
            self.inner.write_all(&buf[..buf.len() / 2])?;
            return Err(io::Error::other("disk full"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
impl JournalFile for FlakyFile {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        if self.fail_truncate {
            return Err(io::Error::other("read-only"));
        }
        self.inner.set_len(len)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roombook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(start: Ms, end: Ms) -> Event {
        Event::BookingCreated {
            booking: Booking::pending(
                Ulid::new(),
                Ulid::new(),
                "staff".into(),
                "seminar".into(),
                Span::new(start, end),
                0,
            ),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let first = created(1000, 2000);
        let second = Event::BookingStatusChanged {
            id: Ulid::new(),
            room_id: Ulid::new(),
            status: BookingStatus::Approved,
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&second).unwrap();
            assert_eq!(wal.appends_since_compact(), 2);
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first, second]);
        assert!(!replay.discarded_tail);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("does_not_exist.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(!replay.discarded_tail);
    }

    #[test]
    fn truncated_tail_is_discarded() {
        let path = tmp_path("truncated.wal");
        let keep = created(1000, 2000);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&keep).unwrap();
            wal.append(&created(3000, 4000)).unwrap();
        }
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![keep]);
        assert!(replay.discarded_tail);
    }

    #[test]
    fn corrupt_crc_stops_replay() {
        let path = tmp_path("corrupt.wal");
        let keep = created(1000, 2000);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&keep).unwrap();
            wal.append(&created(3000, 4000)).unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![keep]);
        assert!(replay.discarded_tail);
    }

    fn flaky_wal(path: &Path) -> Wal<FlakyFile> {
        Wal::with_file(FlakyFile::open(path), path, 0)
    }

    #[test]
    fn failed_flush_leaves_no_trace_on_replay() {
        let path = tmp_path("failed_flush.wal");
        let before = created(1000, 2000);
        let lost = created(3000, 4000);
        let after = created(5000, 6000);

        let mut wal = flaky_wal(&path);
        wal.append(&before).unwrap();
        let synced = wal.synced_len();

        wal.file_mut().fail_writes = true;
        assert!(wal.append(&lost).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);

        wal.file_mut().fail_writes = false;
        wal.append(&after).unwrap();
        assert_eq!(wal.appends_since_compact(), 2);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![before, after]);
        assert!(!replay.discarded_tail);
    }

    #[test]
    fn discarded_events_are_never_written() {
        let path = tmp_path("discard_staged.wal");
        let kept = created(1000, 2000);
        let mut wal = flaky_wal(&path);
        wal.append_buffered(&created(3000, 4000)).unwrap();
        wal.discard_staged();
        wal.append(&kept).unwrap();

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![kept]);
    }

    #[test]
    fn failed_rollback_poisons_journal() {
        let path = tmp_path("poisoned.wal");
        let mut wal = flaky_wal(&path);
        wal.append(&created(1000, 2000)).unwrap();

        wal.file_mut().fail_writes = true;
        wal.file_mut().fail_truncate = true;
        assert!(wal.append(&created(3000, 4000)).is_err());

        wal.file_mut().fail_writes = false;
        wal.file_mut().fail_truncate = false;
        assert!(wal.append(&created(5000, 6000)).is_err());
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        let survivor = created(1000, 2000);
        let mut wal = Wal::open(&path).unwrap();
        for i in 0..10 {
            wal.append(&created(i * 10_000, i * 10_000 + 500)).unwrap();
        }
        wal.compact(std::slice::from_ref(&survivor)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);

        let after = created(5000, 6000);
        wal.append(&after).unwrap();

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![survivor, after]);
    }
}
