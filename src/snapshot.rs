// Snapshot persistence through the storage collaborator

use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use tracing::warn;

use crate::{DMX_UNIVERSE_SIZE, PORT_COUNT};

/// Blob storage for per-port fail-safe snapshots. The core only requests
/// loads and saves; ownership of the medium stays with the collaborator.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, port: usize) -> Option<[u8; DMX_UNIVERSE_SIZE]>;
    fn save(&self, port: usize, data: &[u8; DMX_UNIVERSE_SIZE]) -> io::Result<()>;
}

/// File-per-port store, one `snap_port{N}.bin` blob per port.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, port: usize) -> PathBuf {
        self.dir.join(format!("snap_port{}.bin", port))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, port: usize) -> Option<[u8; DMX_UNIVERSE_SIZE]> {
        let path = self.path(port);
        let blob = std::fs::read(&path).ok()?;
        match <[u8; DMX_UNIVERSE_SIZE]>::try_from(blob.as_slice()) {
            Ok(data) => Some(data),
            Err(_) => {
                warn!(
                    "snapshot {} has wrong size ({} bytes), ignoring",
                    path.display(),
                    blob.len()
                );
                None
            }
        }
    }

    fn save(&self, port: usize, data: &[u8; DMX_UNIVERSE_SIZE]) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path(port), data)
    }
}

/// In-memory store for tests and snapshot-less deployments.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slots: Mutex<[Option<[u8; DMX_UNIVERSE_SIZE]>; PORT_COUNT]>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, port: usize) -> Option<[u8; DMX_UNIVERSE_SIZE]> {
        self.slots.lock().get(port).copied().flatten()
    }

    fn save(&self, port: usize, data: &[u8; DMX_UNIVERSE_SIZE]) -> io::Result<()> {
        self.slots.lock()[port] = Some(*data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dmxnode-test-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn file_store_round_trips() {
        let dir = scratch_dir("roundtrip");
        let store = FileSnapshotStore::new(&dir);
        assert!(store.load(0).is_none());

        let data = [0xAB; DMX_UNIVERSE_SIZE];
        store.save(0, &data).unwrap();
        assert_eq!(store.load(0), Some(data));
        assert!(store.load(1).is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_store_rejects_wrong_size() {
        let dir = scratch_dir("badsize");
        let store = FileSnapshotStore::new(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("snap_port2.bin"), [1u8; 10]).unwrap();
        assert!(store.load(2).is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemorySnapshotStore::new();
        assert!(store.load(3).is_none());
        let data = [7; DMX_UNIVERSE_SIZE];
        store.save(3, &data).unwrap();
        assert_eq!(store.load(3), Some(data));
    }
}
