//! Snapshot persistence for the review index.
//!
//! A snapshot is two artifacts next to each other:
//!
//! `<base>.index` holds the vectors.
//!
//! Header (55 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - slot_count: u64 (little-endian)
//! - generation: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Slots (repeated slot_count times, in slot order):
//! - vector: [f32; dimensions] (little-endian, unit length)
//!
//! `<base>.meta` is JSON holding the slot-parallel `ids` (null for a removed
//! slot) and `texts`, plus the same `generation`. Both artifacts are written
//! to temp files, synced, then renamed, vectors first. Vectors exactly one
//! generation ahead of the metadata mean a save stopped between the two
//! renames: the metadata's slots are read back and the unfinished save is
//! dropped. Any other generation mismatch is corruption.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::semantic::index::FlatIndex;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + slot_count(8) + generation(8) + checksum(4)
const HEADER_SIZE: usize = 55;

/// Bytes covered by the header checksum
const CHECKSUMMED_HEADER: usize = HEADER_SIZE - 4;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot artifact missing: {0}")]
    Missing(PathBuf),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Generation mismatch: vectors at {index}, metadata at {meta}")]
    GenerationMismatch { index: u64, meta: u64 },
}

/// Which snapshot artifacts are present on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    /// Neither artifact exists
    Missing,
    /// Only one of the two artifacts exists
    Partial,
    /// Both artifacts exist
    Present,
}

/// Borrowed view of the state to persist.
pub struct SnapshotRef<'a> {
    pub generation: u64,
    pub model_name: &'a str,
    pub model_id: &'a [u8; 32],
    pub index: &'a FlatIndex,
    pub ids: &'a [Option<i64>],
    pub texts: &'a [String],
}

/// A snapshot read back from disk.
#[derive(Debug)]
pub struct Snapshot {
    pub generation: u64,
    pub index: FlatIndex,
    pub ids: Vec<Option<i64>>,
    pub texts: Vec<String>,
    /// The vectors were one save ahead of the metadata; the unfinished save
    /// was dropped
    pub recovered: bool,
}

/// Metadata artifact contents.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta<T> {
    version: u8,
    generation: u64,
    model: String,
    ids: Vec<Option<i64>>,
    texts: T,
}

/// Storage manager for the two snapshot artifacts.
pub struct SnapshotStorage {
    index_path: PathBuf,
    meta_path: PathBuf,
}

impl SnapshotStorage {
    /// Create a storage manager for artifacts at `<base>.index` and
    /// `<base>.meta`.
    pub fn new(base: &Path) -> Self {
        Self {
            index_path: with_suffix(base, ".index"),
            meta_path: with_suffix(base, ".meta"),
        }
    }

    /// Path of the vector artifact.
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Path of the metadata artifact.
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Check which artifacts exist.
    pub fn state(&self) -> ArtifactState {
        match (self.index_path.exists(), self.meta_path.exists()) {
            (true, true) => ArtifactState::Present,
            (false, false) => ArtifactState::Missing,
            _ => ArtifactState::Partial,
        }
    }

    /// Load a snapshot, metadata first, then vectors.
    ///
    /// Vectors one generation ahead of the metadata are an interrupted save
    /// and load as the metadata's generation with `recovered` set. Any other
    /// disagreement between the two artifacts is reported as an error; the
    /// caller decides whether to start fresh.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<Snapshot, VectorStorageError> {
        for path in [&self.meta_path, &self.index_path] {
            if !path.exists() {
                return Err(VectorStorageError::Missing(path.clone()));
            }
        }

        let meta: SnapshotMeta<Vec<String>> =
            serde_json::from_reader(BufReader::new(File::open(&self.meta_path)?))?;

        if meta.version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(meta.version, FORMAT_VERSION));
        }
        if meta.ids.len() != meta.texts.len() {
            return Err(VectorStorageError::InvalidFormat(format!(
                "metadata has {} ids but {} texts",
                meta.ids.len(),
                meta.texts.len()
            )));
        }

        let mut reader = BufReader::new(File::open(&self.index_path)?);
        let header = Self::read_header(&mut reader)?;
        Self::validate_header(&header, expected_model_id, expected_dimensions)?;

        let slots = meta.ids.len();
        let recovered = if header.generation == meta.generation {
            if header.slot_count != slots as u64 {
                return Err(VectorStorageError::InvalidFormat(format!(
                    "vectors hold {} slots but metadata holds {slots}",
                    header.slot_count
                )));
            }
            false
        } else if header.generation.checked_sub(1) == Some(meta.generation)
            && header.slot_count >= slots as u64
        {
            // Save stopped between the two renames. Slots are append-only,
            // so the first `slots` vectors still belong to the metadata.
            true
        } else {
            return Err(VectorStorageError::GenerationMismatch {
                index: header.generation,
                meta: meta.generation,
            });
        };

        let dimensions = header.dimensions as usize;
        let mut index = FlatIndex::with_capacity(dimensions, slots);
        let mut vector = vec![0f32; dimensions];
        for _ in 0..slots {
            Self::read_vector(&mut reader, &mut vector)?;
            index
                .push_normalized(&vector)
                .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;
        }

        if !recovered {
            let mut trailing = [0u8; 1];
            if reader.read(&mut trailing)? != 0 {
                return Err(VectorStorageError::InvalidFormat(
                    "trailing bytes after last slot".to_string(),
                ));
            }
        }

        Ok(Snapshot {
            generation: meta.generation,
            index,
            ids: meta.ids,
            texts: meta.texts,
            recovered,
        })
    }

    /// Save a snapshot.
    ///
    /// Uses atomic write for both artifacts: temp files -> fsync -> rename.
    pub fn save(&self, snapshot: &SnapshotRef<'_>) -> Result<(), VectorStorageError> {
        if let Some(parent) = self.index_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let index_tmp = with_suffix(&self.index_path, ".tmp");
        let meta_tmp = with_suffix(&self.meta_path, ".tmp");

        let result = Self::write_index(&index_tmp, snapshot)
            .and_then(|_| Self::write_meta(&meta_tmp, snapshot))
            .and_then(|_| {
                std::fs::rename(&index_tmp, &self.index_path)?;
                std::fs::rename(&meta_tmp, &self.meta_path)?;
                Ok(())
            });

        if result.is_err() {
            // Clean up temp files on error
            let _ = std::fs::remove_file(&index_tmp);
            let _ = std::fs::remove_file(&meta_tmp);
        }

        result
    }

    /// Delete both artifacts if they exist.
    pub fn delete(&self) -> Result<(), VectorStorageError> {
        for path in [&self.index_path, &self.meta_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn write_index(path: &Path, snapshot: &SnapshotRef<'_>) -> Result<(), VectorStorageError> {
        let index = snapshot.index;
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "dimension {} does not fit the header",
                index.dimensions()
            ))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *snapshot.model_id,
            dimensions,
            slot_count: index.len() as u64,
            generation: snapshot.generation,
            checksum: 0, // Will be computed
        };
        Self::write_header(&mut writer, &header)?;

        for vector in index.iter() {
            for &value in vector {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        Self::finish(writer)
    }

    fn write_meta(path: &Path, snapshot: &SnapshotRef<'_>) -> Result<(), VectorStorageError> {
        let meta = SnapshotMeta {
            version: FORMAT_VERSION,
            generation: snapshot.generation,
            model: snapshot.model_name.to_string(),
            ids: snapshot.ids.to_vec(),
            texts: snapshot.texts,
        };

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &meta)?;

        Self::finish(writer)
    }

    /// Flush and sync
    fn finish(mut writer: BufWriter<File>) -> Result<(), VectorStorageError> {
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        file.sync_all()?;
        Ok(())
    }

    /// Read header from file.
    fn read_header(reader: &mut impl Read) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];

        // Version check first
        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[CHECKSUMMED_HEADER..]));
        if stored_checksum != crc32fast::hash(&header_bytes[..CHECKSUMMED_HEADER]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        Ok(Header {
            version,
            model_id,
            dimensions: u16::from_le_bytes(le_array(&header_bytes[33..35])),
            slot_count: u64::from_le_bytes(le_array(&header_bytes[35..43])),
            generation: u64::from_le_bytes(le_array(&header_bytes[43..51])),
            checksum: stored_checksum,
        })
    }

    /// Validate header against expected values.
    fn validate_header(
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    /// Write header to file.
    fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.slot_count.to_le_bytes());
        header_bytes[43..51].copy_from_slice(&header.generation.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[..CHECKSUMMED_HEADER]);
        header_bytes[CHECKSUMMED_HEADER..].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    /// Read one slot's vector into `out`.
    fn read_vector(reader: &mut impl Read, out: &mut [f32]) -> Result<(), VectorStorageError> {
        let mut float_bytes = [0u8; 4];
        for value in out.iter_mut() {
            reader.read_exact(&mut float_bytes)?;
            *value = f32::from_le_bytes(float_bytes);
        }
        Ok(())
    }
}

/// File header structure.
#[derive(Debug)]
#[allow(dead_code)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    slot_count: u64,
    generation: u64,
    checksum: u32,
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
