use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ulid::Ulid;

use crate::model::{Record, Status};

/// Append-only log of booking records.
///
/// Entry layout: `[u32 le: len][bincode Record][u32 le: crc32 of payload]`.
/// A torn or checksum-failing tail (crash mid-write) is dropped on replay.
/// A record that decodes but contradicts the bookings before it is treated
/// as corruption and fails the replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_rewrite: u64,
}

fn write_entry(out: &mut impl Write, record: &Record) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` on EOF, even partway through.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next checksummed payload, or `None` at the end of the usable log.
fn next_payload(reader: &mut impl Read, path: &Path) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        tracing::warn!("WAL {}: torn final entry discarded", path.display());
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        tracing::warn!("WAL {}: CRC mismatch, discarding tail", path.display());
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Booking-level consistency of the record stream: every booking is created
/// once with a forward span, and status changes only name bookings that
/// exist, under the provider they were created for.
#[derive(Default)]
struct Ledger {
    providers: HashMap<Ulid, Ulid>,
}

impl Ledger {
    fn admit(&mut self, record: &Record) -> Result<(), String> {
        match record {
            Record::Created(b) => {
                if b.span.start >= b.span.end {
                    return Err(format!("booking {} has empty or inverted span {}", b.id, b.span));
                }
                if b.updated_at < b.created_at {
                    return Err(format!("booking {} updated before it was created", b.id));
                }
                if self.providers.insert(b.id, b.provider_id).is_some() {
                    return Err(format!("booking {} created twice", b.id));
                }
            }
            Record::StatusChanged {
                id,
                provider_id,
                status,
                ..
            } => {
                match self.providers.get(id) {
                    None => return Err(format!("status change for unknown booking {id}")),
                    Some(p) if p != provider_id => {
                        return Err(format!("booking {id} moved from provider {p} to {provider_id}"));
                    }
                    Some(_) => {}
                }
                if *status == Status::Pending {
                    return Err(format!("booking {id} changed back to pending"));
                }
            }
        }
        Ok(())
    }
}

impl Wal {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_rewrite: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer a record. Not durable until `commit`.
    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        write_entry(&mut self.writer, record)?;
        self.appends_since_rewrite += 1;
        Ok(())
    }

    /// Flush buffered records and fsync.
    pub fn commit(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn appends_since_rewrite(&self) -> u64 {
        self.appends_since_rewrite
    }

    /// Replace the log with `snapshot`: written and fsynced to a sibling temp
    /// file, then renamed over the log.
    pub fn rewrite(&mut self, snapshot: &[Record]) -> io::Result<()> {
        self.commit()?;
        let tmp = self.path.with_extension("wal.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in snapshot {
                write_entry(&mut out, record)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_rewrite = 0;
        Ok(())
    }

    /// Read every committed record from `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut ledger = Ledger::default();
        let mut records = Vec::new();

        while let Some(payload) = next_payload(&mut reader, path)? {
            let record: Record = match bincode::deserialize(&payload) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("WAL {}: undecodable record ({e}), discarding tail", path.display());
                    break;
                }
            };
            ledger.admit(&record).map_err(|why| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("WAL {} entry {}: {why}", path.display(), records.len()),
                )
            })?;
            records.push(record);
        }
        Ok(records)
    }
}
