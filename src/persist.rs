//! Saving sleep adjustment state between runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::{fs, io};
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::dsa::DsaSnapshot;
use crate::Error;

/// Storage for per-display [`DsaSnapshot`]s, keyed by
/// [`DisplayRef::persistence_key`](crate::DisplayRef::persistence_key).
pub trait DsaStore: Send + Sync {
    /// Stores the state of one display.
    fn save(&self, key: &str, snapshot: &DsaSnapshot) -> Result<(), Error>;

    /// Loads the state of one display.
    fn restore(&self, key: &str) -> Result<Option<DsaSnapshot>, Error>;

    /// Forgets one display, or every display when `key` is `None`.
    fn erase(&self, key: Option<&str>) -> Result<(), Error>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    displays: BTreeMap<String, DsaSnapshot>,
}

/// A [`DsaStore`] backed by one TOML file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Stores state in `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `ddc-exchange/sleep.toml` in the user's cache directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("ddc-exchange").join("sleep.toml"))
    }

    /// A store at [`default_path`](Self::default_path).
    pub fn open_default() -> Result<Self, Error> {
        FileStore::default_path()
            .map(FileStore::new)
            .ok_or_else(|| Error::Store("no cache directory".into()))
    }

    /// The file backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StoreFile, Error> {
        let s = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoreFile::default()),
            Err(e) => return Err(e.into()),
        };

        toml::from_str(&s)
            .map_err(|e| Error::Store(format!("{}: {}", self.path.display(), e)))
    }

    fn write(&self, file: &StoreFile) -> Result<(), Error> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let s = toml::to_string(file)
            .map_err(|e| Error::Store(e.to_string()))?;
        fs::write(&self.path, s)?;
        debug!(path = %self.path.display(), displays = file.displays.len(), "saved sleep adjustments");
        Ok(())
    }
}

impl DsaStore for FileStore {
    fn save(&self, key: &str, snapshot: &DsaSnapshot) -> Result<(), Error> {
        let _lock = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.read()?;
        file.displays.insert(key.to_owned(), snapshot.clone());
        self.write(&file)
    }

    fn restore(&self, key: &str) -> Result<Option<DsaSnapshot>, Error> {
        let _lock = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read()?.displays.remove(key))
    }

    fn erase(&self, key: Option<&str>) -> Result<(), Error> {
        let _lock = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match key {
            Some(key) => {
                let mut file = self.read()?;
                if file.displays.remove(key).is_some() {
                    self.write(&file)?;
                }
                Ok(())
            },
            None => match fs::remove_file(&self.path) {
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                res => res.map_err(Error::from),
            },
        }
    }
}

/// A [`DsaStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    displays: Mutex<BTreeMap<String, DsaSnapshot>>,
}

impl DsaStore for MemoryStore {
    fn save(&self, key: &str, snapshot: &DsaSnapshot) -> Result<(), Error> {
        self.displays.lock().unwrap_or_else(|e| e.into_inner()).insert(key.to_owned(), snapshot.clone());
        Ok(())
    }

    fn restore(&self, key: &str) -> Result<Option<DsaSnapshot>, Error> {
        Ok(self.displays.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    fn erase(&self, key: Option<&str>) -> Result<(), Error> {
        let mut displays = self.displays.lock().unwrap_or_else(|e| e.into_inner());
        match key {
            Some(key) => { displays.remove(key); },
            None => displays.clear(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;

    fn temp_store(name: &str) -> FileStore {
        let path = std::env::temp_dir()
            .join(format!("ddc-exchange-test-{}-{}", process::id(), name))
            .join("sleep.toml");
        FileStore::new(path)
    }

    fn snapshot(factor: f64) -> DsaSnapshot {
        DsaSnapshot {
            adjustment_factor: factor,
            check_interval: 2,
            total_adjustments: 1,
        }
    }

    #[test]
    fn file_store_round_trip() {
        let store = temp_store("round-trip");
        assert_eq!(store.restore("a").unwrap(), None);
        store.save("a", &snapshot(2.0)).unwrap();
        store.save("b", &snapshot(1.5)).unwrap();
        assert_eq!(store.restore("a").unwrap(), Some(snapshot(2.0)));

        store.erase(Some("a")).unwrap();
        assert_eq!(store.restore("a").unwrap(), None);
        assert_eq!(store.restore("b").unwrap(), Some(snapshot(1.5)));

        store.erase(None).unwrap();
        assert_eq!(store.restore("b").unwrap(), None);
        store.erase(None).unwrap();
        if let Some(dir) = store.path().parent() {
            let _ = fs::remove_dir(dir);
        }
    }

    #[test]
    fn corrupt_file_is_a_store_error() {
        let store = temp_store("corrupt");
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "displays = 4").unwrap();
        match store.restore("a") {
            Err(Error::Store(..)) => (),
            res => panic!("unexpected {:?}", res),
        }
        store.erase(None).unwrap();
        let _ = fs::remove_dir(store.path().parent().unwrap());
    }

    #[test]
    fn memory_store() {
        let store = MemoryStore::default();
        store.save("a", &snapshot(3.0)).unwrap();
        assert_eq!(store.restore("a").unwrap(), Some(snapshot(3.0)));
        store.erase(None).unwrap();
        assert_eq!(store.restore("a").unwrap(), None);
    }
}
