use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record<R: Serialize>(writer: &mut impl Write, record: &R) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one `[len][payload][crc]` frame. `Ok(None)` at a clean or torn end.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut crc_buf = [0u8; 4];
    match reader.read_exact(&mut crc_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Append-only write-ahead log of `R` records.
///
/// Format per entry: `[u32: len][bincode: R][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt tail ends replay; everything before it is kept.
pub struct Wal<R> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(R)>,
}

impl<R: Serialize + DeserializeOwned> Wal<R> {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Append and fsync one record. Production code batches with
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, record: &R) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer one record without flushing. Durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, record: &R) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
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

    /// Write the compacted record set to `<path>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, records: &[R]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[R]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay every valid record. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<R>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<R>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, Service, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn professional() -> Event {
        Event::ProfessionalCreated {
            id: Ulid::new(),
            email: "pro@example.com".into(),
            name: "Pro".into(),
        }
    }

    fn service(professional_id: Ulid) -> Event {
        Event::ServiceCreated {
            service: Service {
                id: Ulid::new(),
                professional_id,
                name: "Cut".into(),
                duration_ms: 3_600_000,
                price_cents: Some(2500),
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![professional(), service(Ulid::new())];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = professional();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = professional();
        let bad = Event::BlockDeactivated {
            id: Ulid::new(),
            professional_id: Ulid::new(),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![good]);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_then_append.wal");
        let pid = Ulid::new();
        let created = professional();
        let block_id = Ulid::new();
        let linked = Event::ExternalEventLinked {
            id: Ulid::new(),
            professional_id: pid,
            event_id: "evt-1".into(),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created).unwrap();
            for _ in 0..10 {
                wal.append(&Event::BlockDeactivated {
                    id: block_id,
                    professional_id: pid,
                })
                .unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&created)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let after = fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted log should shrink: {after} < {before}");
            wal.append(&linked).unwrap();
        }
        let replayed: Vec<Event> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![created, linked]);
    }

    #[test]
    fn buffered_appends_count_until_flush() {
        let path = tmp_path("buffered.wal");
        let records: Vec<Span> = (0..5).map(|i| Span::new(i, i + 1)).collect();
        {
            let mut wal: Wal<Span> = Wal::open(&path).unwrap();
            for r in &records {
                wal.append_buffered(r).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        let replayed: Vec<Span> = Wal::replay(&path).unwrap();
        assert_eq!(replayed, records);
    }
}
