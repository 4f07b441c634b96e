//! Directory-backed peer state store.
//!
//! One file per blob key under the configured state directory. The blob
//! contents are opaque here; layout belongs to the callers.

use std::io;
use std::path::PathBuf;

use vigil_services::PeerStateStore;

pub struct DirStateStore {
    root: PathBuf,
}

impl DirStateStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(DirStateStore { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.root.join(name)
    }
}

impl PeerStateStore for DirStateStore {
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&self, key: &str, blob: &[u8]) -> io::Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, blob)?;
        std::fs::rename(tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStateStore::new(dir.path()).unwrap();
        assert_eq!(store.load("reputation").unwrap(), None);
        store.store("reputation", b"{\"scores\":[]}").unwrap();
        assert_eq!(
            store.load("reputation").unwrap().as_deref(),
            Some(&b"{\"scores\":[]}"[..])
        );
    }

    #[test]
    fn keys_with_separators_are_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStateStore::new(dir.path()).unwrap();
        store.store("agreement:unit-a", b"a").unwrap();
        store.store("agreement:unit-b", b"b").unwrap();
        assert_eq!(store.load("agreement:unit-a").unwrap().unwrap(), b"a");
        assert_eq!(store.load("agreement:unit-b").unwrap().unwrap(), b"b");
    }
}
