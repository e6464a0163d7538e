//! Durable robot descriptors and the catalog of known models.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ViewerError, ViewerResult};

pub const URDF_MEDIA_TYPE: &str = "application/xml";

/// Named, immutable file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    pub name: String,
    pub media_type: Option<String>,
    pub bytes: Arc<[u8]>,
}

impl FileBlob {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self { name: name.into(), media_type: None, bytes: bytes.into() }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A robot description plus the geometry files it references, keyed by file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotDescriptor {
    pub id: String,
    pub name: String,
    pub description: FileBlob,
    pub geometry: BTreeMap<String, FileBlob>,
}

impl RobotDescriptor {
    /// Creates a descriptor with a fresh `robot-<uuid>` id.
    pub fn new(name: impl Into<String>, description: FileBlob, geometry: impl IntoIterator<Item = FileBlob>) -> Self {
        Self::with_id(new_robot_id(), name, description, geometry)
    }

    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        description: FileBlob,
        geometry: impl IntoIterator<Item = FileBlob>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description,
            geometry: geometry.into_iter().map(|blob| (blob.name.clone(), blob)).collect(),
        }
    }

    pub fn reference(&self) -> DescriptorRef {
        DescriptorRef { id: self.id.clone(), name: self.name.clone() }
    }
}

pub fn new_robot_id() -> String {
    format!("robot-{}", uuid::Uuid::new_v4())
}

/// `{id, name}` pair persisted in the app state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RigState {
    Inactive,
    Active,
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub descriptor: Arc<RobotDescriptor>,
    pub state: RigState,
}

/// Known descriptors in insertion order with their rig state. Removal is only legal while
/// inactive.
#[derive(Debug, Default)]
pub struct ModelCatalog {
    entries: IndexMap<String, CatalogEntry>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor as inactive. An existing id keeps its state and original descriptor.
    pub fn insert(&mut self, descriptor: RobotDescriptor) -> Arc<RobotDescriptor> {
        let entry = self
            .entries
            .entry(descriptor.id.clone())
            .or_insert_with(|| CatalogEntry { descriptor: Arc::new(descriptor), state: RigState::Inactive });
        entry.descriptor.clone()
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.values().find(|entry| entry.descriptor.name == name)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<RigState> {
        self.entries.get(id).map(|entry| entry.state)
    }

    pub fn set_state(&mut self, id: &str, state: RigState) -> ViewerResult<()> {
        let entry = self.entries.get_mut(id).ok_or_else(|| ViewerError::RobotNotFound(id.to_string()))?;
        entry.state = state;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> ViewerResult<Arc<RobotDescriptor>> {
        match self.entries.get(id).map(|entry| entry.state) {
            None => Err(ViewerError::RobotNotFound(id.to_string())),
            Some(RigState::Active) => Err(ViewerError::protocol(format!("Robot {id} is active; deactivate it first"))),
            Some(RigState::Inactive) => self
                .entries
                .shift_remove(id)
                .map(|entry| entry.descriptor)
                .ok_or_else(|| ViewerError::RobotNotFound(id.to_string())),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.state == RigState::Active)
            .map(|entry| entry.descriptor.id.clone())
            .collect()
    }

    pub fn references(&self) -> Vec<DescriptorRef> {
        self.entries.values().map(|entry| entry.descriptor.reference()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
