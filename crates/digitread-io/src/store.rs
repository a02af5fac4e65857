//! Model persistence on the local filesystem.

use std::io::Write;
use std::path::{Path, PathBuf};

use digitread_pipeline::{ModelStore, StoreError};

/// Stores each model as `<dir>/<key>.bin`.
///
/// Writes go to a uniquely named temporary file in the same directory
/// that is then renamed over the target, so readers never observe a
/// partially written model and concurrent writers never share a file.
#[derive(Debug, Clone)]
pub struct FsModelStore {
    dir: PathBuf,
}

impl FsModelStore {
    /// A store rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `key` is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`] unless `key` is a non-empty run
    /// of ASCII letters, digits, `-`, `_`, or `.` not starting with `.`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(self.dir.join(format!("{key}.bin")))
        } else {
            Err(StoreError::InvalidKey(key.to_owned()))
        }
    }
}

impl ModelStore for FsModelStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => {
                log::debug!("read {} bytes from {}", bytes.len(), path.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir)?;
        let mut staging = tempfile::NamedTempFile::new_in(&self.dir)?;
        staging.write_all(bytes)?;
        staging.persist(&path).map_err(|e| e.error)?;
        log::debug!("wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use digitread_pipeline::MODEL_KEY;

    #[test]
    fn missing_model_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModelStore::new(dir.path());
        assert_eq!(store.load(MODEL_KEY).unwrap(), None);
    }

    #[test]
    fn save_then_load_in_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModelStore::new(dir.path().join("models").join("v1"));
        store.save(MODEL_KEY, b"{\"weights\":[]}").unwrap();

        let expected = dir.path().join("models/v1/digit-classifier-v1.bin");
        assert!(expected.exists());
        assert_eq!(
            store.load(MODEL_KEY).unwrap().as_deref(),
            Some(&b"{\"weights\":[]}"[..])
        );
    }

    #[test]
    fn save_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModelStore::new(dir.path());
        store.save(MODEL_KEY, b"a").unwrap();
        store.save(MODEL_KEY, b"b").unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["digit-classifier-v1.bin".to_owned()]);
        assert_eq!(store.load(MODEL_KEY).unwrap().unwrap(), b"b");
    }

    #[test]
    fn concurrent_saves_leave_one_complete_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsModelStore::new(dir.path());
        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 64 * 1024]).collect();

        std::thread::scope(|s| {
            for payload in &payloads {
                let store = &store;
                s.spawn(move || store.save(MODEL_KEY, payload).unwrap());
            }
        });

        let saved = store.load(MODEL_KEY).unwrap().unwrap();
        assert!(payloads.contains(&saved));
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn path_like_keys_are_refused() {
        let store = FsModelStore::new("/tmp");
        for key in ["", "../escape", "a/b", ".hidden"] {
            assert!(
                matches!(store.path_for(key), Err(StoreError::InvalidKey(_))),
                "{key}"
            );
        }
    }
}
