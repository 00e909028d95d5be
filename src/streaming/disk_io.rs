//! Chunk record serialization and disk I/O
//!
//! Record layout (little-endian):
//!
//! | field              | type    |
//! |--------------------|---------|
//! | magic `ISOC`       | 4 bytes |
//! | format version     | u32     |
//! | chunk coordinate   | 3 × i32 |
//! | samples per axis   | u16     |
//! | applied edit seq   | u64     |
//! | body length        | u32     |
//! | body               | LZ4 (size-prepended) rkyv archive |

use std::io;
use std::path::{Path, PathBuf};

use rkyv::{Archive, Deserialize, Serialize};

use crate::voxel::chunk::{ChunkBuffers, ChunkCoord, ChunkSnapshot};
use crate::voxel::density::{DensityGrid, GridSpec};

pub const RECORD_MAGIC: &[u8; 4] = b"ISOC";
pub const RECORD_VERSION: u32 = 1;
pub const RECORD_HEADER_SIZE: usize = 4 + 4 + 12 + 2 + 8 + 4;
const RECORD_EXTENSION: &str = "isc";

/// Serializable record body
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq)]
pub struct ChunkRecordBody {
    pub density: Vec<f32>,
    /// One bit per sample, LSB first
    pub active_bits: Vec<u8>,
    pub durability: Vec<f32>,
}

/// Parsed record header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u32,
    pub coord: ChunkCoord,
    pub samples_per_axis: u16,
    pub applied_sequence: u64,
    pub body_len: u32,
}

/// A decoded record ready to install into a chunk
#[derive(Debug, PartialEq)]
pub struct DecodedRecord {
    pub buffers: ChunkBuffers,
    pub applied_sequence: u64,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, &b) in bits.iter().enumerate() {
        if b {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

pub fn unpack_bit(bytes: &[u8], i: usize) -> bool {
    bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0)
}

/// Serialize a snapshot into a complete record.
pub fn encode_record(snapshot: &ChunkSnapshot) -> io::Result<Vec<u8>> {
    let grid = &snapshot.buffers.grid;
    let body = ChunkRecordBody {
        density: grid.samples().to_vec(),
        active_bits: pack_bits(grid.active_states()),
        durability: snapshot.buffers.durability.clone(),
    };

    let archived = rkyv::to_bytes::<rkyv::rancor::Error>(&body)
        .map_err(|e| io::Error::other(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&archived);

    let samples_per_axis = u16::try_from(grid.samples_per_axis())
        .map_err(|_| invalid("resolution too large for record header"))?;
    let body_len = u32::try_from(compressed.len())
        .map_err(|_| invalid("record body too large"))?;

    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + compressed.len());
    out.extend_from_slice(RECORD_MAGIC);
    out.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    out.extend_from_slice(&snapshot.coord.x.to_le_bytes());
    out.extend_from_slice(&snapshot.coord.y.to_le_bytes());
    out.extend_from_slice(&snapshot.coord.z.to_le_bytes());
    out.extend_from_slice(&samples_per_axis.to_le_bytes());
    out.extend_from_slice(&snapshot.applied_sequence.to_le_bytes());
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Parse and validate the fixed header.
pub fn decode_header(data: &[u8]) -> io::Result<RecordHeader> {
    if data.len() < RECORD_HEADER_SIZE {
        return Err(invalid(format!("record truncated: {} bytes", data.len())));
    }
    if &data[0..4] != RECORD_MAGIC {
        return Err(invalid("Invalid magic bytes"));
    }
    let le4 = |o: usize| -> [u8; 4] { [data[o], data[o + 1], data[o + 2], data[o + 3]] };
    let version = u32::from_le_bytes(le4(4));
    if version != RECORD_VERSION {
        return Err(invalid(format!("Unsupported version: {}", version)));
    }
    let coord = ChunkCoord::new(
        i32::from_le_bytes(le4(8)),
        i32::from_le_bytes(le4(12)),
        i32::from_le_bytes(le4(16)),
    );
    let samples_per_axis = u16::from_le_bytes([data[20], data[21]]);
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&data[22..30]);
    let applied_sequence = u64::from_le_bytes(seq);
    let body_len = u32::from_le_bytes(le4(30));

    Ok(RecordHeader {
        version,
        coord,
        samples_per_axis,
        applied_sequence,
        body_len,
    })
}

/// Decode a record for `coord` under the world's grid geometry.
///
/// Any mismatch (coordinate, sample count, body length, active bits that
/// disagree with the densities) is reported as `InvalidData`.
pub fn decode_record(data: &[u8], coord: ChunkCoord, spec: &GridSpec) -> io::Result<DecodedRecord> {
    let header = decode_header(data)?;
    if header.coord != coord {
        return Err(invalid(format!("record holds {:?}", header.coord)));
    }
    if u32::from(header.samples_per_axis) != spec.samples_per_axis() {
        return Err(invalid(format!(
            "record has {} samples per axis, world uses {}",
            header.samples_per_axis,
            spec.samples_per_axis()
        )));
    }
    let body = &data[RECORD_HEADER_SIZE..];
    if body.len() != header.body_len as usize {
        return Err(invalid(format!(
            "body length {} does not match header {}",
            body.len(),
            header.body_len
        )));
    }

    let decompressed = lz4_flex::decompress_size_prepended(body)
        .map_err(|e| invalid(format!("LZ4 decompression failed: {}", e)))?;
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(decompressed.len());
    aligned.extend_from_slice(&decompressed);

    let archived = rkyv::access::<ArchivedChunkRecordBody, rkyv::rancor::Error>(&aligned)
        .map_err(|e| invalid(e.to_string()))?;
    let record: ChunkRecordBody = rkyv::deserialize::<ChunkRecordBody, rkyv::rancor::Error>(archived)
        .map_err(|e| invalid(e.to_string()))?;

    let count = spec.sample_count();
    if record.density.len() != count || record.durability.len() != count {
        return Err(invalid(format!(
            "expected {} samples, found {} density / {} durability",
            count,
            record.density.len(),
            record.durability.len()
        )));
    }
    if record.active_bits.len() != count.div_ceil(8) {
        return Err(invalid("active state array has wrong length"));
    }

    let grid = DensityGrid::from_samples(spec.resolution, spec.surface_level, record.density);
    let consistent = grid
        .active_states()
        .iter()
        .enumerate()
        .all(|(i, &a)| unpack_bit(&record.active_bits, i) == a);
    if !consistent {
        return Err(invalid("active states disagree with densities"));
    }

    Ok(DecodedRecord {
        buffers: ChunkBuffers::new(grid, record.durability),
        applied_sequence: header.applied_sequence,
    })
}

/// Get the file path for a chunk record
pub fn chunk_path(base_dir: &Path, coord: ChunkCoord) -> PathBuf {
    // Format: base_dir/y_{coord.y}/chunk_{x}_{y}_{z}.isc
    base_dir
        .join(format!("y_{}", coord.y))
        .join(format!("chunk_{}_{}_{}.{}", coord.x, coord.y, coord.z, RECORD_EXTENSION))
}

/// Write a record atomically (temp file, then rename).
pub async fn save_record(base_dir: &Path, snapshot: &ChunkSnapshot) -> io::Result<()> {
    let path = chunk_path(base_dir, snapshot.coord);

    // Create parent directory if it doesn't exist
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = encode_record(snapshot)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

/// Read a raw record, `None` if the chunk was never saved.
pub async fn read_record(base_dir: &Path, coord: ChunkCoord) -> io::Result<Option<Vec<u8>>> {
    let path = chunk_path(base_dir, coord);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
