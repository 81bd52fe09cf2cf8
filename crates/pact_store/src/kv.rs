//! File-per-key blob stores for committed and staged values.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use pact_commit::twopc::KeyValueStore;

/// Directory-backed `KeyValueStore`: each key is a file and the value its
/// contents. Writes are fsynced before acknowledging.
pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    /// Open the store rooted at `base`, creating the directory if needed.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .with_context(|| format!("create store dir {}", base.display()))?;
        Ok(Self { base })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }
}

impl KeyValueStore for FileStore {
    fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key);
        let mut file =
            File::create(&path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(value.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", path.display()))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<String> {
        fs::read_to_string(self.key_path(key)).with_context(|| format!("no value for key {key}"))
    }

    fn del(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.base)
            .with_context(|| format!("list store dir {}", self.base.display()))?
        {
            keys.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_del_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path().join("committed")).expect("open");

        store.put("alice", "john").expect("put");
        assert_eq!(store.get("alice").expect("get"), "john");

        store.put("alice", "jane").expect("overwrite");
        assert_eq!(store.get("alice").expect("get"), "jane");

        store.del("alice").expect("del");
        assert!(store.get("alice").is_err());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");
        store.del("missing").expect("del");
        store.del("missing").expect("del again");
    }

    #[test]
    fn list_names_every_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path()).expect("open");

        store.put("a", "1").expect("put");
        store.put("b", "2").expect("put");

        let mut keys = store.list().expect("list");
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
