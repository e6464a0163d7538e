//! Turns descriptors into live rigs and back.
//!
//! Activation is split into [`LoadingPipeline::prepare`] (register geometry references, parse,
//! build) and [`LoadingPipeline::commit`] (register joints, attach, announce). Each prepare
//! takes a generation ticket for its robot; deactivating the robot bumps the generation, so a
//! rig prepared before the deactivation is discarded at commit instead of reappearing.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;

use crate::descriptor::RobotDescriptor;
use crate::error::{ViewerError, ViewerResult};
use crate::geometry::{LoadedGeometry, LoaderRegistry};
use crate::joints::JointController;
use crate::lifecycle::Viewer;
use crate::protocol::{MessageType, Publisher, RobotLoaded};
use crate::rig::{build_rig, Rig};
use crate::urdf::parse_urdf;

const REF_SCHEME: &str = "blob:";
const REF_HASH_LEN: usize = 16;

/// Ephemeral `blob:` references to geometry bytes, held per robot id.
#[derive(Debug, Default)]
pub struct BlobRegistry {
    by_robot: HashMap<String, IndexMap<String, String>>,
    live: HashMap<String, Arc<[u8]>>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a reference for every geometry blob the robot does not already hold. Returns the
    /// references created by this call.
    pub fn register(&mut self, descriptor: &RobotDescriptor) -> Vec<String> {
        let held = self.by_robot.entry(descriptor.id.clone()).or_default();
        let mut created = Vec::new();
        for (file, blob) in &descriptor.geometry {
            if held.contains_key(file) {
                continue;
            }
            let hash = blake3::hash(&blob.bytes).to_hex();
            let reference = format!("{REF_SCHEME}{}/{}", descriptor.id, &hash.as_str()[..REF_HASH_LEN]);
            self.live.entry(reference.clone()).or_insert_with(|| blob.bytes.clone());
            held.insert(file.clone(), reference.clone());
            created.push(reference);
        }
        created
    }

    /// Reference registered for `file` under `robot_id`.
    pub fn lookup(&self, robot_id: &str, file: &str) -> Option<&str> {
        self.by_robot.get(robot_id)?.get(file).map(String::as_str)
    }

    pub fn bytes(&self, reference: &str) -> Option<Arc<[u8]>> {
        self.live.get(reference).cloned()
    }

    /// Releases the given references of one robot.
    pub fn release_refs(&mut self, robot_id: &str, references: &[String]) {
        let Some(held) = self.by_robot.get_mut(robot_id) else { return };
        held.retain(|_, reference| !references.contains(reference));
        if held.is_empty() {
            self.by_robot.remove(robot_id);
        }
        self.collect_unreferenced();
    }

    /// Releases everything held for `robot_id`. Returns how many references were dropped.
    pub fn release(&mut self, robot_id: &str) -> usize {
        let released = self.by_robot.remove(robot_id).map(|held| held.len()).unwrap_or(0);
        self.collect_unreferenced();
        released
    }

    pub fn held_by(&self, robot_id: &str) -> usize {
        self.by_robot.get(robot_id).map(IndexMap::len).unwrap_or(0)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn collect_unreferenced(&mut self) {
        let referenced: BTreeSet<&String> = self.by_robot.values().flat_map(IndexMap::values).collect();
        self.live.retain(|reference, _| referenced.contains(reference));
    }
}

/// Resolves mesh paths of one robot's description. The robot id is fixed at construction.
pub struct GeometryResolver<'a> {
    robot_id: &'a str,
    blobs: &'a BlobRegistry,
    loaders: &'a LoaderRegistry,
}

impl<'a> GeometryResolver<'a> {
    pub fn new(robot_id: &'a str, blobs: &'a BlobRegistry, loaders: &'a LoaderRegistry) -> Self {
        Self { robot_id, blobs, loaders }
    }

    /// Looks the file up by its last path segment, then by the full path, and finally reads the
    /// literal path from disk.
    pub fn resolve(&self, path: &str) -> Result<LoadedGeometry> {
        let bytes = self.bytes_for(path)?;
        let loader = self.loaders.loader_for(path);
        loader.load(&bytes).with_context(|| format!("{} loader failed on '{path}'", loader.format_name()))
    }

    fn bytes_for(&self, path: &str) -> Result<Arc<[u8]>> {
        let segment = path.rsplit(['/', '\\']).next().unwrap_or(path);
        let registered = self
            .blobs
            .lookup(self.robot_id, segment)
            .or_else(|| self.blobs.lookup(self.robot_id, path))
            .and_then(|reference| self.blobs.bytes(reference));
        if let Some(bytes) = registered {
            return Ok(bytes);
        }
        let literal = path.trim_start_matches("file://").trim_start_matches("package://");
        log::debug!("[loading] {}: '{segment}' not uploaded, reading '{literal}'", self.robot_id);
        let bytes = fs::read(literal).with_context(|| format!("geometry file '{path}' not found"))?;
        Ok(bytes.into())
    }
}

/// Proof that a prepare was started for a robot at a given generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationTicket {
    generation: u64,
}

/// A built rig waiting to be committed.
#[derive(Debug)]
pub struct PreparedRig {
    pub robot_id: String,
    pub name: String,
    pub rig: Rig,
    ticket: ActivationTicket,
    created_refs: Vec<String>,
}

#[derive(Debug)]
pub enum CommitOutcome {
    Loaded(RobotLoaded),
    /// The robot was deactivated after prepare; the rig was dropped.
    Discarded,
}

pub struct LoadingPipeline {
    blobs: BlobRegistry,
    loaders: LoaderRegistry,
    generations: HashMap<String, u64>,
    active: IndexMap<String, RobotLoaded>,
}

impl LoadingPipeline {
    pub fn new(loaders: LoaderRegistry) -> Self {
        Self { blobs: BlobRegistry::new(), loaders, generations: HashMap::new(), active: IndexMap::new() }
    }

    pub fn blobs(&self) -> &BlobRegistry {
        &self.blobs
    }

    pub fn is_active(&self, robot_id: &str) -> bool {
        self.active.contains_key(robot_id)
    }

    pub fn active_ids(&self) -> impl Iterator<Item = &str> {
        self.active.keys().map(String::as_str)
    }

    /// Prepares and commits in one step. An already active robot is returned as is.
    pub fn activate(
        &mut self,
        descriptor: &RobotDescriptor,
        viewer: &mut Viewer,
        joints: &mut JointController,
        publisher: &Publisher,
    ) -> ViewerResult<RobotLoaded> {
        if let Some(loaded) = self.active.get(&descriptor.id) {
            return Ok(loaded.clone());
        }
        let prepared = self.prepare(descriptor)?;
        match self.commit(prepared, viewer, joints, publisher) {
            CommitOutcome::Loaded(loaded) => Ok(loaded),
            CommitOutcome::Discarded => Err(ViewerError::load(&descriptor.name, "activation was superseded")),
        }
    }

    /// Registers geometry references, parses the description and builds the rig. On failure
    /// the references created here are released again.
    pub fn prepare(&mut self, descriptor: &RobotDescriptor) -> ViewerResult<PreparedRig> {
        let generation = self.generations.entry(descriptor.id.clone()).or_insert(0);
        *generation += 1;
        let ticket = ActivationTicket { generation: *generation };

        let created_refs = self.blobs.register(descriptor);
        match self.build(descriptor) {
            Ok(rig) => Ok(PreparedRig {
                robot_id: descriptor.id.clone(),
                name: descriptor.name.clone(),
                rig,
                ticket,
                created_refs,
            }),
            Err(err) => {
                self.blobs.release_refs(&descriptor.id, &created_refs);
                log::warn!("[loading] {} failed: {err:#}", descriptor.name);
                Err(ViewerError::load(&descriptor.name, err))
            }
        }
    }

    fn build(&self, descriptor: &RobotDescriptor) -> Result<Rig> {
        let robot = parse_urdf(&descriptor.description.bytes).context("invalid robot description")?;
        let resolver = GeometryResolver::new(&descriptor.id, &self.blobs, &self.loaders);
        build_rig(&robot, &mut |path: &str| resolver.resolve(path))
    }

    /// Attaches a prepared rig unless its robot was deactivated since the prepare.
    pub fn commit(
        &mut self,
        prepared: PreparedRig,
        viewer: &mut Viewer,
        joints: &mut JointController,
        publisher: &Publisher,
    ) -> CommitOutcome {
        let PreparedRig { robot_id, name, mut rig, ticket, created_refs } = prepared;
        if self.generations.get(&robot_id) != Some(&ticket.generation) {
            log::info!("[loading] {name}: discarding rig prepared before deactivation");
            self.blobs.release_refs(&robot_id, &created_refs);
            return CommitOutcome::Discarded;
        }
        rig.position = glam::Vec3::ZERO;
        rig.rotation = glam::Vec3::ZERO;
        let joint_names = joints.register(&robot_id, &name, &rig).into_iter().map(|joint| joint.name).collect();
        if !viewer.attach_rig(&robot_id, rig) {
            log::debug!("[loading] {name}: viewer not mounted; rig kept off-scene");
        }
        let loaded = RobotLoaded { robot_id: robot_id.clone(), name, joints: joint_names };
        self.active.insert(robot_id, loaded.clone());
        log::info!("[loading] {} active with {} joint(s)", loaded.name, loaded.joints.len());
        publisher.publish(MessageType::RobotLoaded, &loaded);
        CommitOutcome::Loaded(loaded)
    }

    /// Detaches the rig, drops its joint state, then releases its geometry references.
    /// Pending prepares for the robot are invalidated. Returns whether it was active.
    pub fn deactivate(&mut self, robot_id: &str, viewer: &mut Viewer, joints: &mut JointController) -> bool {
        if let Some(generation) = self.generations.get_mut(robot_id) {
            *generation += 1;
        }
        let was_active = self.active.shift_remove(robot_id).is_some();
        if was_active {
            viewer.detach_rig(robot_id);
            joints.unregister(robot_id);
        }
        let released = self.blobs.release(robot_id);
        if was_active {
            log::info!("[loading] {robot_id} deactivated, {released} reference(s) released");
        }
        was_active
    }
}
