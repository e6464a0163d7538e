//! Durable storage of uploaded descriptors and the last app state.
//!
//! Layout under the store root:
//!
//! ```text
//! VERSION                     schema version, decimal
//! files/<blake3(id)>.bin      bincode descriptor record
//! state/current.json          app state record
//! ```
//!
//! Opening a store written with another schema version wipes both sub-stores.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::descriptor::{DescriptorRef, FileBlob, RobotDescriptor, URDF_MEDIA_TYPE};
use crate::error::{ViewerError, ViewerResult};
use crate::scene::SceneConfig;

pub const STATE_KEY: &str = "current";
const VERSION_FILE: &str = "VERSION";
const FILES_DIR: &str = "files";
const STATE_DIR: &str = "state";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DescriptorRecord {
    id: String,
    name: String,
    description_bytes: Vec<u8>,
    geometry_bytes_by_name: BTreeMap<String, Vec<u8>>,
}

/// Last known catalog and scene settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateRecord {
    pub descriptors: Vec<DescriptorRef>,
    pub scene_config: SceneConfig,
}

#[derive(Serialize, Deserialize)]
struct KeyedState {
    id: String,
    #[serde(flatten)]
    record: AppStateRecord,
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    /// Opens or creates the store at `root`, wiping it when its schema version differs.
    pub fn open(root: impl Into<PathBuf>, version: u32) -> ViewerResult<Self> {
        let store = Self { root: root.into() };
        fs::create_dir_all(&store.root).map_err(|err| ViewerError::store("create store root", err))?;
        let version_path = store.root.join(VERSION_FILE);
        let existing = match fs::read_to_string(&version_path) {
            Ok(text) => text.trim().parse::<u32>().ok(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(ViewerError::store("read store version", err)),
        };
        if existing != Some(version) {
            if let Some(previous) = existing {
                log::info!("[store] schema {previous} -> {version}; clearing stored models");
            }
            store.reset_dirs()?;
            write_atomic(&version_path, version.to_string().as_bytes())
                .map_err(|err| ViewerError::store("write store version", err))?;
        }
        fs::create_dir_all(store.files_dir()).map_err(|err| ViewerError::store("create files store", err))?;
        fs::create_dir_all(store.state_dir()).map_err(|err| ViewerError::store("create state store", err))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes the descriptor's bytes under its id, replacing any previous record.
    pub fn save(&self, descriptor: &RobotDescriptor) -> ViewerResult<()> {
        let record = DescriptorRecord {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            description_bytes: descriptor.description.bytes.to_vec(),
            geometry_bytes_by_name: descriptor
                .geometry
                .iter()
                .map(|(file, blob)| (file.clone(), blob.bytes.to_vec()))
                .collect(),
        };
        let bytes = bincode::serialize(&record).map_err(|err| ViewerError::store("encode descriptor", err))?;
        write_atomic(&self.record_path(&descriptor.id), &bytes)
            .map_err(|err| ViewerError::store(&format!("save {}", descriptor.id), err))
    }

    /// Rebuilds one descriptor; `None` when there is no readable record.
    pub fn restore_one(&self, entry: &DescriptorRef) -> Option<RobotDescriptor> {
        let path = self.record_path(&entry.id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                log::warn!("{}", ViewerError::store(&format!("read {}", entry.id), err));
                return None;
            }
        };
        let record: DescriptorRecord = match bincode::deserialize(&bytes) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("{}", ViewerError::store(&format!("decode {}", entry.id), err));
                return None;
            }
        };
        if record.id != entry.id {
            log::warn!("[store] record at {} belongs to {}", path.display(), record.id);
            return None;
        }
        let description = FileBlob::new(entry.name.clone(), record.description_bytes).with_media_type(URDF_MEDIA_TYPE);
        let geometry =
            record.geometry_bytes_by_name.into_iter().map(|(file, bytes)| FileBlob::new(file, bytes));
        Some(RobotDescriptor::with_id(record.id, entry.name.clone(), description, geometry))
    }

    /// Restores every entry that has a record; the rest are skipped.
    pub fn restore(&self, entries: &[DescriptorRef]) -> Vec<RobotDescriptor> {
        entries.iter().filter_map(|entry| self.restore_one(entry)).collect()
    }

    pub fn delete(&self, id: &str) -> ViewerResult<()> {
        match fs::remove_file(self.record_path(id)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                Err(ViewerError::store(&format!("delete {id}"), err))
            }
            _ => Ok(()),
        }
    }

    /// Empties both sub-stores.
    pub fn clear(&self) -> ViewerResult<()> {
        self.reset_dirs()
    }

    pub fn save_state(&self, record: &AppStateRecord) -> ViewerResult<()> {
        let keyed = KeyedState { id: STATE_KEY.to_string(), record: record.clone() };
        let bytes = serde_json::to_vec_pretty(&keyed).map_err(|err| ViewerError::store("encode app state", err))?;
        write_atomic(&self.state_path(), &bytes).map_err(|err| ViewerError::store("save app state", err))
    }

    pub fn get_state(&self) -> ViewerResult<Option<AppStateRecord>> {
        let bytes = match fs::read(self.state_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ViewerError::store("read app state", err)),
        };
        let keyed: KeyedState =
            serde_json::from_slice(&bytes).map_err(|err| ViewerError::store("decode app state", err))?;
        Ok(Some(keyed.record))
    }

    fn files_dir(&self) -> PathBuf {
        self.root.join(FILES_DIR)
    }

    fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.files_dir().join(format!("{}.bin", blake3::hash(id.as_bytes()).to_hex()))
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir().join(format!("{STATE_KEY}.json"))
    }

    fn reset_dirs(&self) -> ViewerResult<()> {
        for dir in [self.files_dir(), self.state_dir()] {
            match fs::remove_dir_all(&dir) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => {
                    return Err(ViewerError::store(&format!("remove {}", dir.display()), err));
                }
                _ => {}
            }
            fs::create_dir_all(&dir).map_err(|err| ViewerError::store(&format!("create {}", dir.display()), err))?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

enum StoreCommand {
    Save(Arc<RobotDescriptor>),
    Delete(String),
    SaveState(AppStateRecord),
    Clear,
    Flush(Sender<()>),
}

/// Runs store writes on a background thread. Failures are logged and never reach the caller.
pub struct StoreWorker {
    tx: Option<Sender<StoreCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl StoreWorker {
    pub fn spawn(store: ModelStore) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<StoreCommand>();
        let handle = thread::Builder::new().name("model-store".to_string()).spawn(move || {
            for command in rx {
                let result = match command {
                    StoreCommand::Save(descriptor) => store.save(&descriptor),
                    StoreCommand::Delete(id) => store.delete(&id),
                    StoreCommand::SaveState(record) => store.save_state(&record),
                    StoreCommand::Clear => store.clear(),
                    StoreCommand::Flush(done) => {
                        let _ = done.send(());
                        Ok(())
                    }
                };
                if let Err(err) = result {
                    log::warn!("{err}");
                }
            }
        })?;
        Ok(Self { tx: Some(tx), handle: Some(handle) })
    }

    pub fn save(&self, descriptor: Arc<RobotDescriptor>) {
        self.send(StoreCommand::Save(descriptor));
    }

    pub fn delete(&self, id: &str) {
        self.send(StoreCommand::Delete(id.to_string()));
    }

    pub fn save_state(&self, record: AppStateRecord) {
        self.send(StoreCommand::SaveState(record));
    }

    pub fn clear(&self) {
        self.send(StoreCommand::Clear);
    }

    /// Blocks until every command queued before this call has run.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        self.send(StoreCommand::Flush(done_tx));
        let _ = done_rx.recv();
    }

    fn send(&self, command: StoreCommand) {
        let Some(tx) = &self.tx else { return };
        if tx.send(command).is_err() {
            log::warn!("[store] worker has stopped; write dropped");
        }
    }
}

impl Drop for StoreWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("[store] worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> RobotDescriptor {
        RobotDescriptor::with_id(
            id,
            "arm.urdf",
            FileBlob::new("arm.urdf", b"<robot name=\"arm\"/>".to_vec()),
            [FileBlob::new("base.stl", vec![0u8, 1, 2, 255]), FileBlob::new("link.dae", b"<COLLADA/>".to_vec())],
        )
    }

    #[test]
    fn save_and_restore_are_byte_identical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::open(dir.path(), 1).expect("open");
        let original = descriptor("robot-1");
        store.save(&original).expect("save");

        let restored = store.restore_one(&original.reference()).expect("restore");
        assert_eq!(restored.id, original.id);
        assert_eq!(restored.description.bytes, original.description.bytes);
        assert_eq!(restored.description.media_type.as_deref(), Some(URDF_MEDIA_TYPE));
        assert_eq!(restored.geometry.len(), 2);
        for (file, blob) in &original.geometry {
            assert_eq!(restored.geometry[file].bytes, blob.bytes);
        }
    }

    #[test]
    fn restore_filters_missing_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::open(dir.path(), 1).expect("open");
        store.save(&descriptor("a")).expect("save a");
        let entries = vec![
            DescriptorRef { id: "a".into(), name: "arm.urdf".into() },
            DescriptorRef { id: "b".into(), name: "gone.urdf".into() },
        ];
        let restored = store.restore(&entries);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, "a");

        store.delete("a").expect("delete");
        store.delete("a").expect("delete twice");
        assert!(store.restore(&entries).is_empty());
    }

    #[test]
    fn upsert_replaces_previous_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::open(dir.path(), 1).expect("open");
        store.save(&descriptor("a")).expect("save");
        let mut updated = descriptor("a");
        updated.geometry.clear();
        store.save(&updated).expect("save again");
        let restored = store.restore_one(&updated.reference()).expect("restore");
        assert!(restored.geometry.is_empty());
    }

    #[test]
    fn state_uses_fixed_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::open(dir.path(), 1).expect("open");
        assert_eq!(store.get_state().expect("empty state"), None);
        let record = AppStateRecord {
            descriptors: vec![DescriptorRef { id: "a".into(), name: "arm.urdf".into() }],
            scene_config: SceneConfig { fov: 50.0, ..SceneConfig::default() },
        };
        store.save_state(&record).expect("save state");
        assert_eq!(store.get_state().expect("state"), Some(record));

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join("state/current.json")).expect("read")).expect("json");
        assert_eq!(raw["id"], STATE_KEY);
        assert_eq!(raw["sceneConfig"]["fov"], 50.0);
    }

    #[test]
    fn version_change_wipes_both_sub_stores() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::open(dir.path(), 1).expect("open v1");
        store.save(&descriptor("a")).expect("save");
        store
            .save_state(&AppStateRecord { descriptors: Vec::new(), scene_config: SceneConfig::default() })
            .expect("save state");

        let reopened = ModelStore::open(dir.path(), 1).expect("reopen v1");
        assert!(reopened.restore_one(&descriptor("a").reference()).is_some());

        let upgraded = ModelStore::open(dir.path(), 2).expect("open v2");
        assert!(upgraded.restore_one(&descriptor("a").reference()).is_none());
        assert_eq!(upgraded.get_state().expect("state"), None);
        assert_eq!(fs::read_to_string(dir.path().join("VERSION")).expect("version"), "2");
    }

    #[test]
    fn worker_applies_commands_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::open(dir.path(), 1).expect("open");
        let worker = StoreWorker::spawn(store.clone()).expect("spawn worker");
        worker.save(Arc::new(descriptor("a")));
        worker.save(Arc::new(descriptor("b")));
        worker.delete("a");
        worker.flush();

        assert!(store.restore_one(&descriptor("a").reference()).is_none());
        assert!(store.restore_one(&descriptor("b").reference()).is_some());

        worker.clear();
        worker.flush();
        assert!(store.restore_one(&descriptor("b").reference()).is_none());
    }
}
