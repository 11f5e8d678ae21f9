use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::MAX_EVENT_BYTES;
use crate::model::Event;

/// Bytes around each payload: the length prefix and the trailing checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Encode one event as `[len][bincode][crc32]` and return the bytes written.
/// Oversized events are refused so nothing reaches disk that replay would reject.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_EVENT_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("event of {} bytes exceeds {MAX_EVENT_BYTES}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() as u64 + FRAME_OVERHEAD)
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the log ended (cleanly or mid-entry).
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Intact prefix of a log file.
struct Scan {
    events: Vec<Event>,
    /// Byte length of the entries in `events`. Anything past it is damage.
    intact_len: u64,
}

fn scan(path: &Path) -> io::Result<Scan> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Scan {
                events: Vec::new(),
                intact_len: 0,
            });
        }
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_chunk(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_EVENT_BYTES {
            warn!(path = %path.display(), len, "implausible WAL entry length, replay stops here");
            break;
        }
        let mut payload = vec![0u8; len];
        if !read_chunk(&mut reader, &mut payload)? {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if !read_chunk(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            warn!(path = %path.display(), "corrupt WAL entry, replay stops here");
            break;
        }
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(path = %path.display(), "undecodable WAL entry, replay stops here: {e}");
                break;
            }
        }
        intact_len += len as u64 + FRAME_OVERHEAD;
    }

    Ok(Scan { events, intact_len })
}

/// Append-only booking log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC), at most
///   [`MAX_EVENT_BYTES`].
/// - Replay stops at the first entry that is short, oversized or fails its CRC.
///   [`Wal::recover`] cuts the file back to that point before appending again.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Bytes handed to `writer`, synced or not.
    len: u64,
    /// File length as of the last successful `flush_sync`.
    synced_len: u64,
    appends_since_compact: u64,
    unsynced_appends: u64,
}

impl Wal {
    /// Open (or create) the log at `path` for appends. Callers that may face a
    /// damaged tail use [`Wal::recover`] instead.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            len,
            synced_len: len,
            appends_since_compact: 0,
            unsynced_appends: 0,
        })
    }

    /// Replay the intact entries at `path`, truncate whatever follows them, and
    /// open the log for appends. New entries therefore always land where replay
    /// will find them.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let Scan { events, intact_len } = scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > intact_len
        {
            warn!(
                path = %path.display(),
                discarded_bytes = meta.len() - intact_len,
                "truncating damaged booking log tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, events))
    }

    /// Append one event and fsync. Production writes go through `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.len += encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        self.unsynced_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.len;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Forget every append since the last successful `flush_sync`: buffered bytes
    /// are discarded and the file is cut back to its synced length.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        drop(stale.into_parts());
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.len = self.synced_len;
        self.appends_since_compact -= self.unsynced_appends;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Replace the log with `events`: write `<path>.wal.tmp`, fsync, rename over the
    /// live file, reopen for appends.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp = self.path.with_extension("wal.tmp");
        let mut written = 0;
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for event in events {
                written += encode_event(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.len = written;
        self.synced_len = written;
        self.appends_since_compact = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|scan| scan.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AvailabilityWindow;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn provider_saved(name: &str) -> Event {
        Event::ProviderSaved {
            id: Ulid::new(),
            name: name.into(),
            years_of_experience: 12,
            specialty: "Endodontics".into(),
            availability: vec![AvailabilityWindow::new(3, 12, 18)],
        }
    }

    fn booked() -> Event {
        let at = NaiveDate::from_ymd_opt(2024, 1, 3)
            .unwrap()
            .and_hms_opt(13, 0, 0)
            .unwrap();
        Event::AppointmentBooked {
            id: Ulid::new(),
            client_id: Ulid::new(),
            provider_id: Ulid::new(),
            scheduled_at: at,
            created_at: at,
        }
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![provider_saved("Dr. Park"), booked()];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let event = booked();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        append_raw(&path, &[9u8, 0, 0, 0, 1, 2]);

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let first = provider_saved("Dr. Hale");
        let later = booked();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        append_raw(&path, &[9u8, 0, 0, 0, 1, 2]);

        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);
            wal.append(&later).unwrap();
        }

        // Entries written after recovery are visible to the next replay.
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    }

    #[test]
    fn oversized_length_stops_replay() {
        let path = tmp_path("oversized_len.wal");
        let event = booked();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        // A garbage length header followed by a few bytes: never allocated.
        append_raw(&path, &u32::MAX.to_le_bytes());
        append_raw(&path, &[1, 2, 3, 4]);

        assert_eq!(Wal::replay(&path).unwrap(), vec![event.clone()]);

        let (_, events) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![event]);
    }

    #[test]
    fn oversized_event_is_refused() {
        let path = tmp_path("oversized_event.wal");
        let mut wal = Wal::open(&path).unwrap();
        let huge = provider_saved(&"x".repeat(MAX_EVENT_BYTES + 1));

        assert!(wal.append(&huge).is_err());
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
        let (_, events) = Wal::recover(&path).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn bad_crc_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = Event::AppointmentCancelled { id: Ulid::new() };
        let bad = Event::ProviderDeleted { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        let payload = bincode::serialize(&bad).unwrap();
        append_raw(&path, &(payload.len() as u32).to_le_bytes());
        append_raw(&path, &payload);
        append_raw(&path, &0xDEAD_BEEFu32.to_le_bytes());

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let keep = provider_saved("Dr. Ueda");
        let after = booked();

        let mut wal = Wal::open(&path).unwrap();
        for _ in 0..10 {
            wal.append(&booked()).unwrap();
            wal.append(&Event::AppointmentCancelled { id: Ulid::new() }).unwrap();
        }
        wal.append(&keep).unwrap();
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        wal.append(&after).unwrap();
        assert_eq!(wal.appends_since_compact(), 1);
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, after]);
    }

    #[test]
    fn rollback_forgets_unsynced_appends() {
        let path = tmp_path("rollback.wal");
        let kept = provider_saved("Dr. Voss");
        let after = booked();

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        for _ in 0..3 {
            wal.append_buffered(&booked()).unwrap();
        }
        // Push part of the batch to the file as a failing flush might.
        wal.writer.flush().unwrap();
        wal.rollback().unwrap();
        assert_eq!(wal.appends_since_compact(), 1);

        wal.append(&after).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
    }

    #[test]
    fn buffered_appends_count_until_flushed() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..4).map(|_| booked()).collect();

        let mut wal = Wal::open(&path).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 4);
        wal.flush_sync().unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
