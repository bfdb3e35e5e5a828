use std::path::{Path, PathBuf};

use crate::{validate_key, write_atomic, CheckpointStore, CheckpointStoreError};

#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    root: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CheckpointStoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn put(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<(), CheckpointStoreError> {
        let path = self.path_for(key)?;
        if overwrite {
            write_atomic(&path, bytes)?;
            return Ok(());
        }

        match std::fs::read(&path) {
            Ok(existing) if existing == bytes => Ok(()),
            Ok(_) => Err(CheckpointStoreError::Collision {
                key: key.to_string(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                write_atomic(&path, bytes)?;
                Ok(())
            }
            Err(err) => Err(CheckpointStoreError::Io(err)),
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointStoreError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointStoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(CheckpointStoreError::Io(err)),
        }
    }

    fn contains(&self, key: &str) -> Result<bool, CheckpointStoreError> {
        let path = self.path_for(key)?;
        Ok(path.try_exists()?)
    }

    fn list(&self) -> Result<Vec<String>, CheckpointStoreError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CheckpointStoreError::Io(err)),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_key(&name).is_ok() {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "psw-checkpoint-store-{}-{}-{}",
            test_name,
            std::process::id(),
            psw_observe::time::unix_time_ms()
        ));
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    #[test]
    fn checkpoint_is_write_once_by_key() -> anyhow::Result<()> {
        let store = FsCheckpointStore::new(temp_root("write-once")?);

        store.put("a.json", b"hello", false)?;
        store.put("a.json", b"hello", false)?;

        let err = store.put("a.json", b"goodbye", false).unwrap_err();
        match err {
            CheckpointStoreError::Collision { key } => assert_eq!(key, "a.json"),
            other => panic!("expected Collision, got {other:?}"),
        }
        assert_eq!(store.get("a.json")?, b"hello");
        Ok(())
    }

    #[test]
    fn overwrite_replaces_bytes() -> anyhow::Result<()> {
        let store = FsCheckpointStore::new(temp_root("overwrite")?);
        store.put("a.json", b"one", false)?;
        store.put("a.json", b"two", true)?;
        assert_eq!(store.get("a.json")?, b"two");
        Ok(())
    }

    #[test]
    fn missing_key_is_not_found() -> anyhow::Result<()> {
        let store = FsCheckpointStore::new(temp_root("missing")?);
        assert!(matches!(
            store.get("nope.json"),
            Err(CheckpointStoreError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn list_is_sorted_and_skips_temp_files() -> anyhow::Result<()> {
        let root = temp_root("list")?;
        let store = FsCheckpointStore::new(root.clone());
        store.put("b.json", b"x", false)?;
        store.put("a.json", b"y", false)?;
        std::fs::write(root.join(".b.json.tmp.1.2"), b"partial")?;
        assert_eq!(store.list()?, vec!["a.json".to_string(), "b.json".to_string()]);
        Ok(())
    }

    #[test]
    fn ensure_absent_names_the_first_existing_key() -> anyhow::Result<()> {
        let store = FsCheckpointStore::new(temp_root("absent")?);
        let keys = vec!["a.json".to_string(), "b.json".to_string(), "c.json".to_string()];
        store.ensure_absent(&keys)?;

        store.put("b.json", b"x", false)?;
        assert!(store.contains("b.json")?);
        assert!(!store.contains("a.json")?);
        match store.ensure_absent(&keys).unwrap_err() {
            CheckpointStoreError::Exists { key } => assert_eq!(key, "b.json"),
            other => panic!("expected Exists, got {other:?}"),
        }
        assert!(store.contains("../x").is_err());
        Ok(())
    }
}
