use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Entries claiming to be larger than this are treated as a corrupt tail.
const MAX_ENTRY_BYTES: usize = 16 * 1024 * 1024;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Why replay stopped before the end of the file.
enum Tail {
    Clean,
    Truncated,
    Corrupt,
}

/// Read one entry and its size on disk. `Ok(Err(tail))` means the log ends
/// here.
fn read_entry(reader: &mut impl Read) -> io::Result<Result<(Event, u64), Tail>> {
    fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
        match reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }

    let mut len_buf = [0u8; 4];
    if !fill(reader, &mut len_buf)? {
        return Ok(Err(Tail::Clean));
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_ENTRY_BYTES {
        return Ok(Err(Tail::Corrupt));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc_buf)? {
        return Ok(Err(Tail::Truncated));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Err(Tail::Corrupt));
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .map(|event| (event, 8 + len as u64))
        .map_err(|_| Tail::Corrupt))
}

/// A clinic's append-only write-ahead log.
///
/// Entry format: `[u32 len][bincode Event][u32 crc32]`, little-endian. A
/// crash mid-write leaves a short or mismatching last entry, which replay
/// drops along with anything after it. `recover` cuts it off the file.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. The writer task batches with
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the snapshot events next to the log and fsync them.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
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

    /// All valid events in order. A missing file is an empty log.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::read_valid(path)?.0)
    }

    /// Replay the log, cut any torn tail off the file, and open it for
    /// appending. New entries then follow the last valid one, so a later
    /// replay reads them.
    pub fn recover(path: &Path) -> io::Result<(Vec<Event>, Self)> {
        let (events, valid_len) = Self::read_valid(path)?;
        match OpenOptions::new().write(true).open(path) {
            Ok(file) => {
                let on_disk = file.metadata()?.len();
                if on_disk > valid_len {
                    warn!(path = %path.display(), dropped = on_disk - valid_len, "truncating WAL to its last valid entry");
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok((events, Self::open(path)?))
    }

    /// Valid events and the byte length they occupy.
    fn read_valid(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        loop {
            match read_entry(&mut reader)? {
                Ok((event, size)) => {
                    events.push(event);
                    valid_len += size;
                }
                Err(Tail::Clean) => break,
                Err(Tail::Truncated) => {
                    warn!(path = %path.display(), replayed = events.len(), "WAL ends in a truncated entry; discarding it");
                    break;
                }
                Err(Tail::Corrupt) => {
                    warn!(path = %path.display(), replayed = events.len(), "WAL entry failed its checksum; discarding the rest");
                    break;
                }
            }
        }
        Ok((events, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Appointment, AppointmentStatus, Specialty};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("clinic_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn specialty(name: &str) -> Event {
        Event::SpecialtySaved(Specialty {
            id: Ulid::new(),
            name: name.into(),
            description: None,
        })
    }

    fn booking(doctor_id: Ulid, start: i64) -> Event {
        Event::AppointmentSaved {
            appointment: Appointment {
                id: Ulid::new(),
                doctor_id,
                patient_id: Ulid::new(),
                start,
                duration: 1_800_000,
                status: AppointmentStatus::Pending,
                reason: Some("checkup".into()),
            },
            previous_doctor: None,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![specialty("Cardiology"), booking(Ulid::new(), 1_792_144_800_000)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let path = tmp_path("truncation.wal");
        let event = specialty("Dermatology");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            // A length prefix promising more bytes than follow.
            f.write_all(&40u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("corrupt_crc.wal");
        let good = specialty("Pediatrics");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&Event::DoctorDeleted { id: Ulid::new() }).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_is_corrupt() {
        let path = tmp_path("oversized.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compaction_shrinks_and_survives_appends() {
        let path = tmp_path("compact.wal");
        let doctor_id = Ulid::new();
        let keep = booking(doctor_id, 1_792_144_800_000);
        {
            let mut wal = Wal::open(&path).unwrap();
            for i in 0..20 {
                let churn = booking(doctor_id, 1_792_144_800_000 + i * 1_800_000);
                let Event::AppointmentSaved { appointment, .. } = &churn else {
                    unreachable!()
                };
                let id = appointment.id;
                wal.append(&churn).unwrap();
                wal.append(&Event::AppointmentDeleted { id, doctor_id }).unwrap();
            }
            wal.append(&keep).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        let later = specialty("Neurology");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_count_and_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|i| specialty(&format!("S{i}"))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn_tail.wal");
        let first = specialty("Cardiology");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let valid_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7, 0, 0, 0, 1, 2]).unwrap();
        }

        let later = specialty("Neurology");
        {
            let (events, mut wal) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_on_missing_file_starts_empty() {
        let path = tmp_path("recover_missing.wal");
        let (events, mut wal) = Wal::recover(&path).unwrap();
        assert!(events.is_empty());
        let event = specialty("Oncology");
        wal.append(&event).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }
}
