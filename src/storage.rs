use std::path::{Path, PathBuf};

use crate::eid::Eid;

/// Flat file storage keyed by file name. Used for original uploads and
/// generated thumbnails.
pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> std::io::Result<()>;
    fn path_of(&self, ident: &str) -> PathBuf;
}

#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.path_of(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path_of(ident))
    }

    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.path_of(ident);
        let temp_path = self.base_dir.join(format!("{}-{ident}.tmp", Eid::new()));

        std::fs::write(&temp_path, data)?;

        std::fs::rename(&temp_path, &path)
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.path_of(ident))
    }

    fn path_of(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path().join("files")).unwrap();

        assert!(!store.exists("a.bin"));
        store.write("a.bin", b"hello").unwrap();
        assert!(store.exists("a.bin"));
        assert_eq!(store.read("a.bin").unwrap(), b"hello");

        // overwrite is atomic and leaves no temp files behind
        store.write("a.bin", b"world").unwrap();
        assert_eq!(store.read("a.bin").unwrap(), b"world");
        let entries = std::fs::read_dir(&store.base_dir).unwrap().count();
        assert_eq!(entries, 1);

        store.delete("a.bin").unwrap();
        assert!(!store.exists("a.bin"));
    }

    #[test]
    fn test_path_of_is_inside_base_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();
        assert_eq!(store.path_of("thumb_1.webp"), tmp.path().join("thumb_1.webp"));
    }
}
