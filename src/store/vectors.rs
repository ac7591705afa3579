//! Embedding sidecar file, `vectors.bin`.
//!
//! ```text
//! magic       4 bytes  "PXFV"
//! version     u8
//! dimensions  u16 le
//! count       u64 le
//! entries     count x (id u64 le, dimensions x f32 le)
//! crc32       u32 le over every byte above
//! ```
//!
//! The trailing CRC covers the vectors too, so a torn or bit-flipped file is
//! rejected instead of silently skewing similarity scores.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"PXFV";
const FORMAT_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a vectors file")]
    BadMagic,

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("{0} dimensions do not fit the file header")]
    TooManyDimensions(usize),
}

/// Reader that feeds everything it reads into a CRC32.
struct Crc32Reader<R> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R: Read> Crc32Reader<R> {
    fn read_array<const N: usize>(&mut self) -> std::io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        self.hasher.update(&buf);
        Ok(buf)
    }
}

/// Writer counterpart of [`Crc32Reader`].
struct Crc32Writer<W> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> Crc32Writer<W> {
    fn put(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.hasher.update(bytes);
        self.inner.write_all(bytes)
    }
}

#[derive(Debug)]
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load all embeddings keyed by item id.
    pub fn load(
        &self,
        expected_dimensions: usize,
    ) -> Result<HashMap<u64, Vec<f32>>, VectorStorageError> {
        let mut reader = Crc32Reader {
            inner: BufReader::new(File::open(&self.path)?),
            hasher: crc32fast::Hasher::new(),
        };

        if &reader.read_array::<4>()? != MAGIC {
            return Err(VectorStorageError::BadMagic);
        }

        let [version] = reader.read_array::<1>()?;
        if version != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let dimensions = u16::from_le_bytes(reader.read_array()?) as usize;
        if dimensions != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: dimensions,
            });
        }

        let count = u64::from_le_bytes(reader.read_array()?);

        // count is untrusted until the trailer checks out
        let mut vectors = HashMap::new();
        for _ in 0..count {
            let id = u64::from_le_bytes(reader.read_array()?);
            let embedding = (0..dimensions)
                .map(|_| reader.read_array().map(f32::from_le_bytes))
                .collect::<std::io::Result<Vec<_>>>()?;
            vectors.insert(id, embedding);
        }

        let computed = reader.hasher.clone().finalize();
        let mut trailer = [0u8; 4];
        reader.inner.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != computed {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        Ok(vectors)
    }

    /// Replace the file with `entries`. Written to a sibling temp file,
    /// synced, then renamed over the old one.
    pub fn save<'a, I>(&self, dimensions: usize, entries: I) -> Result<(), VectorStorageError>
    where
        I: ExactSizeIterator<Item = (u64, &'a [f32])>,
    {
        let temp_path = self.path.with_extension("tmp");

        if let Err(err) = Self::write_to(&temp_path, dimensions, entries) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn write_to<'a, I>(path: &Path, dimensions: usize, entries: I) -> Result<(), VectorStorageError>
    where
        I: ExactSizeIterator<Item = (u64, &'a [f32])>,
    {
        let header_dimensions = u16::try_from(dimensions)
            .map_err(|_| VectorStorageError::TooManyDimensions(dimensions))?;

        let mut writer = Crc32Writer {
            inner: BufWriter::new(File::create(path)?),
            hasher: crc32fast::Hasher::new(),
        };

        writer.put(MAGIC)?;
        writer.put(&[FORMAT_VERSION])?;
        writer.put(&header_dimensions.to_le_bytes())?;
        writer.put(&(entries.len() as u64).to_le_bytes())?;

        for (id, embedding) in entries {
            if embedding.len() != dimensions {
                return Err(VectorStorageError::DimensionMismatch {
                    expected: dimensions,
                    got: embedding.len(),
                });
            }

            writer.put(&id.to_le_bytes())?;
            for value in embedding {
                writer.put(&value.to_le_bytes())?;
            }
        }

        let Crc32Writer { mut inner, hasher } = writer;
        inner.write_all(&hasher.finalize().to_le_bytes())?;

        let file = inner.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(list: &[(u64, Vec<f32>)]) -> Vec<(u64, &[f32])> {
        list.iter().map(|(id, v)| (*id, v.as_slice())).collect()
    }

    #[test]
    fn test_save_and_load_with_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("vectors.bin"));

        let data = vec![(1, vec![1.0, 0.0, 0.0]), (7, vec![0.0, 0.6, 0.8])];
        storage.save(3, entries(&data).into_iter()).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(3).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&7], vec![0.0, 0.6, 0.8]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("vectors.bin"));
        storage.save(3, Vec::new().into_iter()).unwrap();

        assert!(matches!(
            storage.load(384),
            Err(VectorStorageError::DimensionMismatch { expected: 384, got: 3 })
        ));
    }

    #[test]
    fn test_wrong_entry_width_is_rejected_and_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let storage = VectorStorage::new(path.clone());

        let data = vec![(1, vec![1.0, 0.0])];
        assert!(storage.save(3, entries(&data).into_iter()).is_err());
        assert!(!path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_oversized_dimensions_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let storage = VectorStorage::new(path.clone());

        // 65536 would wrap to 0 in the header
        assert!(matches!(
            storage.save(65536, Vec::new().into_iter()),
            Err(VectorStorageError::TooManyDimensions(65536))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_flipped_vector_byte_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let storage = VectorStorage::new(path.clone());

        let data = vec![(1, vec![1.0, 0.0, 0.0])];
        storage.save(3, entries(&data).into_iter()).unwrap();

        // header is 15 bytes, id 8 more; this lands inside the first float
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[24] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            storage.load(3),
            Err(VectorStorageError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        let storage = VectorStorage::new(path.clone());

        let data = vec![(1, vec![1.0, 0.0, 0.0]), (2, vec![0.0, 1.0, 0.0])];
        storage.save(3, entries(&data).into_iter()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        assert!(storage.load(3).is_err());
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vectors.bin");
        std::fs::write(&path, b"id,title\n1,cat\n").unwrap();

        assert!(matches!(
            VectorStorage::new(path).load(3),
            Err(VectorStorageError::BadMagic)
        ));
    }
}
