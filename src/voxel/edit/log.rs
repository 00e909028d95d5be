//! Append-only log of applied sample edits for recovery and replay.
//!
//! File layout: `ISED` magic, `u32` version, then fixed-size little-endian
//! records `{sequence u64, chunk 3×i32, local 3×u16, kind u8, delta f32}`.
//! The file is read once when a world is opened; afterwards only the
//! in-memory index is consulted and new records are appended.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::voxel::chunk::ChunkCoord;
use super::delta::{EditKind, SampleEdit};

pub const MAGIC: &[u8; 4] = b"ISED";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 8;
pub const ENTRY_SIZE: usize = 8 + 12 + 6 + 1 + 4;

/// One persisted sample change.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModificationLogEntry {
    pub sequence: u64,
    pub chunk: ChunkCoord,
    pub local: [u16; 3],
    pub kind: EditKind,
    pub delta: f32,
}

impl ModificationLogEntry {
    pub fn new(sequence: u64, chunk: ChunkCoord, edit: &SampleEdit) -> Self {
        Self {
            sequence,
            chunk,
            local: edit.local,
            kind: edit.kind,
            delta: edit.delta,
        }
    }

    pub fn sample_edit(&self) -> SampleEdit {
        SampleEdit {
            local: self.local,
            kind: self.kind,
            delta: self.delta,
        }
    }

    /// True when the entry can apply to a chunk of `resolution`: every local
    /// coordinate is on the lattice and the delta is a finite magnitude.
    pub fn fits(&self, resolution: u32) -> bool {
        self.local.iter().all(|&c| u32::from(c) <= resolution)
            && self.delta.is_finite()
            && self.delta >= 0.0
    }

    /// Append the fixed-size encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.chunk.x.to_le_bytes());
        out.extend_from_slice(&self.chunk.y.to_le_bytes());
        out.extend_from_slice(&self.chunk.z.to_le_bytes());
        for c in self.local {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out.push(self.kind.to_u8());
        out.extend_from_slice(&self.delta.to_le_bytes());
    }

    pub fn decode(buf: &[u8; ENTRY_SIZE]) -> io::Result<Self> {
        let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap_or_default());
        let i32_at = |o: usize| i32::from_le_bytes(buf[o..o + 4].try_into().unwrap_or_default());
        let u16_at = |o: usize| u16::from_le_bytes(buf[o..o + 2].try_into().unwrap_or_default());

        let kind = EditKind::from_u8(buf[26]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown edit kind: {}", buf[26]),
            )
        })?;

        Ok(Self {
            sequence: u64_at(0),
            chunk: ChunkCoord::new(i32_at(8), i32_at(12), i32_at(16)),
            local: [u16_at(20), u16_at(22), u16_at(24)],
            kind,
            delta: f32::from_le_bytes(buf[27..31].try_into().unwrap_or_default()),
        })
    }
}

/// Encode entries for appending.
pub fn encode_entries(entries: &[ModificationLogEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for e in entries {
        e.encode_into(&mut out);
    }
    out
}

fn read_header(reader: &mut impl Read) -> io::Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;
    if &header[..4] != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Invalid magic bytes"));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unsupported version: {}", version),
        ));
    }
    Ok(())
}

fn header_bytes() -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(MAGIC);
    header[4..].copy_from_slice(&VERSION.to_le_bytes());
    header
}

/// In-memory view of a world's edit log.
pub struct EditLog {
    /// Path to the log file
    path: PathBuf,
    /// Per-chunk entries in sequence order
    chunk_index: HashMap<ChunkCoord, Vec<ModificationLogEntry>>,
    /// Next sequence number to hand out
    next_sequence: u64,
    entry_count: usize,
}

impl EditLog {
    /// Open an existing log or create an empty one.
    ///
    /// Entries that cannot apply to a chunk of `resolution` (a local
    /// coordinate past the lattice, an unknown kind or a non-finite delta)
    /// are skipped with a warning. A truncated trailing record is dropped and
    /// cut from the file so later appends stay aligned. A file whose header
    /// cannot be read is moved aside and an empty log takes its place.
    pub fn open(path: impl AsRef<Path>, resolution: u32) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() || std::fs::metadata(&path)?.len() == 0 {
            return Self::create(path);
        }

        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        if let Err(e) = read_header(&mut reader) {
            drop(reader);
            let aside = path.with_extension("corrupt");
            log::warn!(
                "Edit log {:?}: unreadable header ({}), moved to {:?}; starting empty",
                path, e, aside
            );
            std::fs::rename(&path, &aside)?;
            return Self::create(path);
        }

        let mut log = Self {
            path,
            chunk_index: HashMap::new(),
            next_sequence: 1,
            entry_count: 0,
        };

        let mut buf = [0u8; ENTRY_SIZE];
        let mut records = 0usize;
        let mut skipped = 0usize;
        loop {
            match reader.read_exact(&mut buf) {
                Ok(()) => {
                    records += 1;
                    match ModificationLogEntry::decode(&buf) {
                        Ok(entry) if entry.fits(resolution) => log.insert(entry),
                        Ok(entry) => {
                            log::warn!("Edit log {:?}: skipping out-of-range entry {:?}", log.path, entry);
                            skipped += 1;
                        }
                        Err(e) => {
                            log::warn!("Edit log {:?}: skipping record {}: {}", log.path, records, e);
                            skipped += 1;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }

        let valid_len = (HEADER_SIZE + records * ENTRY_SIZE) as u64;
        if file_len > valid_len {
            log::warn!(
                "Edit log {:?}: dropping truncated trailing record ({} bytes)",
                log.path,
                file_len - valid_len
            );
            drop(reader);
            OpenOptions::new().write(true).open(&log.path)?.set_len(valid_len)?;
        }

        log::info!(
            "Edit log {:?}: {} entries across {} chunks ({} skipped)",
            log.path,
            log.entry_count,
            log.chunk_index.len(),
            skipped
        );
        Ok(log)
    }

    fn create(path: PathBuf) -> io::Result<Self> {
        let mut file = File::create(&path)?;
        file.write_all(&header_bytes())?;
        file.sync_all()?;
        Ok(Self {
            path,
            chunk_index: HashMap::new(),
            next_sequence: 1,
            entry_count: 0,
        })
    }

    fn insert(&mut self, entry: ModificationLogEntry) {
        self.next_sequence = self.next_sequence.max(entry.sequence.saturating_add(1));
        self.chunk_index.entry(entry.chunk).or_default().push(entry);
        self.entry_count += 1;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserve the next sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);
        seq
    }

    /// Highest sequence handed out so far (0 when empty)
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Index freshly committed entries; returns their encoding for the file.
    pub fn record(&mut self, entries: &[ModificationLogEntry]) -> Vec<u8> {
        for &e in entries {
            self.insert(e);
        }
        encode_entries(entries)
    }

    /// All entries of a chunk, in sequence order.
    pub fn entries_for_chunk(&self, coord: ChunkCoord) -> &[ModificationLogEntry] {
        self.chunk_index.get(&coord).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entries of a chunk not yet folded into data saved at `applied_sequence`.
    pub fn entries_after(&self, coord: ChunkCoord, applied_sequence: u64) -> Vec<ModificationLogEntry> {
        self.entries_for_chunk(coord)
            .iter()
            .filter(|e| e.sequence > applied_sequence)
            .copied()
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Drop entries already baked into saved records and return the new file
    /// contents.
    ///
    /// `baked` maps a chunk to the applied sequence of its newest durable
    /// record; chunks without an entry keep all their entries. The newest
    /// entry always survives so sequence numbers keep rising after a reopen.
    pub fn compact(&mut self, baked: &HashMap<ChunkCoord, u64>) -> Vec<u8> {
        let newest = self.last_sequence();
        let mut kept: Vec<ModificationLogEntry> = Vec::new();
        for (coord, entries) in self.chunk_index.iter_mut() {
            if let Some(&applied) = baked.get(coord) {
                entries.retain(|e| e.sequence > applied || e.sequence == newest);
            }
            kept.extend(entries.iter().copied());
        }
        self.chunk_index.retain(|_, entries| !entries.is_empty());
        self.entry_count = kept.len();
        kept.sort_by_key(|e| e.sequence);

        let mut out = header_bytes().to_vec();
        out.extend(encode_entries(&kept));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const RES: u32 = 8;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("isoterra_test_{}_{}", std::process::id(), name))
    }

    fn entry(sequence: u64, chunk: ChunkCoord, kind: EditKind) -> ModificationLogEntry {
        ModificationLogEntry {
            sequence,
            chunk,
            local: [1, 2, 3],
            kind,
            delta: 0.25,
        }
    }

    fn append(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn test_entry_encoding() {
        let e = entry(42, ChunkCoord::new(-1, 2, -3), EditKind::Remove);
        let mut buf = Vec::new();
        e.encode_into(&mut buf);
        assert_eq!(buf.len(), ENTRY_SIZE);
        let arr: [u8; ENTRY_SIZE] = buf.try_into().unwrap();
        assert_eq!(ModificationLogEntry::decode(&arr).unwrap(), e);
    }

    #[test]
    fn test_create_and_reopen() {
        let path = temp_path("reopen.ised");
        let _ = std::fs::remove_file(&path);

        let a = ChunkCoord::new(0, 0, 0);
        let b = ChunkCoord::new(1, 0, 0);
        {
            let mut log = EditLog::open(&path, RES).unwrap();
            assert_eq!(log.entry_count(), 0);
            let s1 = log.next_sequence();
            let s2 = log.next_sequence();
            let bytes = log.record(&[entry(s1, a, EditKind::Add), entry(s2, b, EditKind::Remove)]);
            append(&path, &bytes);
        }

        let mut log = EditLog::open(&path, RES).unwrap();
        assert_eq!(log.entry_count(), 2);
        assert_eq!(log.entries_for_chunk(a).len(), 1);
        assert_eq!(log.entries_for_chunk(b)[0].kind, EditKind::Remove);
        assert_eq!(log.next_sequence(), 3);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_truncated_tail_dropped() {
        let path = temp_path("truncated.ised");
        let _ = std::fs::remove_file(&path);

        let c = ChunkCoord::new(0, 0, 0);
        {
            let mut log = EditLog::open(&path, RES).unwrap();
            let bytes = log.record(&[entry(1, c, EditKind::Add), entry(2, c, EditKind::Add)]);
            append(&path, &bytes[..ENTRY_SIZE + 10]);
        }

        let log = EditLog::open(&path, RES).unwrap();
        assert_eq!(log.entry_count(), 1);
        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, HEADER_SIZE + ENTRY_SIZE);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_bad_header_moved_aside() {
        let path = temp_path("bad_magic.ised");
        let aside = path.with_extension("corrupt");
        let _ = std::fs::remove_file(&aside);
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00garbage").unwrap();

        let mut log = EditLog::open(&path, RES).unwrap();
        assert_eq!(log.entry_count(), 0);
        assert_eq!(log.next_sequence(), 1);
        assert_eq!(std::fs::read(&aside).unwrap(), b"NOPE\x01\x00\x00\x00garbage");
        assert_eq!(std::fs::read(&path).unwrap(), header_bytes());

        // Unknown version is treated the same way
        std::fs::write(&path, b"ISED\x09\x00\x00\x00").unwrap();
        assert_eq!(EditLog::open(&path, RES).unwrap().entry_count(), 0);

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&aside);
    }

    #[test]
    fn test_unusable_entries_skipped() {
        let path = temp_path("unusable.ised");
        let _ = std::fs::remove_file(&path);
        let c = ChunkCoord::new(0, 0, 0);
        {
            let _log = EditLog::open(&path, RES).unwrap();
            let mut far = entry(2, c, EditKind::Add);
            far.local = [RES as u16 + 1, 0, 0];
            let mut nan = entry(3, c, EditKind::Add);
            nan.delta = f32::NAN;
            let mut bytes = encode_entries(&[entry(1, c, EditKind::Add), far, nan]);
            let mut unknown = Vec::new();
            entry(4, c, EditKind::Remove).encode_into(&mut unknown);
            unknown[26] = 9;
            bytes.extend(unknown);
            bytes.extend(encode_entries(&[entry(5, c, EditKind::Remove)]));
            append(&path, &bytes);
        }

        let log = EditLog::open(&path, RES).unwrap();
        let kept: Vec<u64> = log.entries_for_chunk(c).iter().map(|e| e.sequence).collect();
        assert_eq!(kept, vec![1, 5]);
        // Skipped records are not mistaken for a truncated tail
        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, HEADER_SIZE + 5 * ENTRY_SIZE);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_entries_after() {
        let path = temp_path("after.ised");
        let _ = std::fs::remove_file(&path);
        let c = ChunkCoord::new(3, 3, 3);
        let mut log = EditLog::open(&path, RES).unwrap();
        log.record(&[
            entry(1, c, EditKind::Add),
            entry(2, c, EditKind::Add),
            entry(3, c, EditKind::Remove),
        ]);
        let replay = log.entries_after(c, 1);
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].sequence, 2);
        assert!(log.entries_after(ChunkCoord::new(0, 0, 0), 0).is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_compact_drops_baked_entries() {
        let path = temp_path("compact.ised");
        let _ = std::fs::remove_file(&path);
        let a = ChunkCoord::new(0, 0, 0);
        let b = ChunkCoord::new(0, 1, 0);

        let mut log = EditLog::open(&path, RES).unwrap();
        log.record(&[
            entry(1, a, EditKind::Add),
            entry(2, b, EditKind::Add),
            entry(3, a, EditKind::Add),
        ]);

        let baked: HashMap<_, _> = [(a, 1u64)].into_iter().collect();
        let bytes = log.compact(&baked);
        assert_eq!(log.entry_count(), 2);
        assert_eq!(bytes.len(), HEADER_SIZE + 2 * ENTRY_SIZE);
        assert_eq!(log.entries_for_chunk(a)[0].sequence, 3);

        std::fs::write(&path, &bytes).unwrap();
        let reopened = EditLog::open(&path, RES).unwrap();
        assert_eq!(reopened.entry_count(), 2);
        assert_eq!(reopened.last_sequence(), 3);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_compact_keeps_newest_entry() {
        let path = temp_path("compact_newest.ised");
        let _ = std::fs::remove_file(&path);
        let a = ChunkCoord::new(0, 0, 0);

        let mut log = EditLog::open(&path, RES).unwrap();
        log.record(&[entry(1, a, EditKind::Add), entry(2, a, EditKind::Remove)]);
        let baked: HashMap<_, _> = [(a, 2u64)].into_iter().collect();
        let bytes = log.compact(&baked);
        assert_eq!(log.entry_count(), 1);
        assert!(log.entries_after(a, 2).is_empty());

        std::fs::write(&path, &bytes).unwrap();
        let mut reopened = EditLog::open(&path, RES).unwrap();
        assert_eq!(reopened.next_sequence(), 3);

        let _ = std::fs::remove_file(&path);
    }
}
