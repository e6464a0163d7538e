//! Posable robot rigs.
//!
//! A rig is an arena of link and joint nodes addressed by [`NodeHandle`]. Nodes are stored so
//! that every parent precedes its children, which lets world transforms be computed in one
//! forward pass.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use glam::{Affine3A, EulerRot, Mat4, Quat, Vec3};
use indexmap::IndexMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::geometry::{LoadedGeometry, Mesh};
use crate::resources::{Geometry, MaterialSlot, ResourceId};
use crate::urdf::{JointKind, UrdfGeometry, UrdfLimit, UrdfLink, UrdfRobot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Link,
    Joint,
}

#[derive(Clone, Debug)]
pub struct Visual {
    pub geometry: Geometry,
    pub materials: MaterialSlot,
    /// Placement relative to the owning link.
    pub local: Mat4,
}

#[derive(Clone, Debug)]
pub struct RigNode {
    pub name: String,
    pub kind: NodeKind,
    pub parent: Option<NodeHandle>,
    pub children: SmallVec<[NodeHandle; 4]>,
    /// Rest transform relative to the parent.
    pub origin: Affine3A,
    /// Joint displacement applied after the origin.
    pub motion: Affine3A,
    pub visuals: Vec<Visual>,
}

/// Native articulation state of one joint node.
#[derive(Clone, Debug, PartialEq)]
pub struct Articulation {
    pub kind: JointKind,
    pub axis: Vec3,
    pub limit: Option<UrdfLimit>,
    /// Radians for angular joints, metres for prismatic ones.
    pub value: f32,
}

#[derive(Debug, Error, PartialEq)]
pub enum PoseError {
    #[error("rig has no joint named '{0}'")]
    UnknownJoint(String),
    #[error("joint '{0}' has no single-value articulation")]
    NotArticulated(String),
}

#[derive(Clone, Debug)]
pub struct Rig {
    name: String,
    nodes: Vec<RigNode>,
    articulations: HashMap<NodeHandle, Articulation>,
    joint_index: IndexMap<String, NodeHandle>,
    pub position: Vec3,
    /// XYZ Euler angles in radians.
    pub rotation: Vec3,
}

impl Rig {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> Option<NodeHandle> {
        (!self.nodes.is_empty()).then_some(NodeHandle(0))
    }

    pub fn node(&self, handle: NodeHandle) -> Option<&RigNode> {
        self.nodes.get(handle.index())
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeHandle, &RigNode)> {
        self.nodes.iter().enumerate().map(|(index, node)| (NodeHandle(index as u32), node))
    }

    pub fn find_node(&self, name: &str, kind: NodeKind) -> Option<NodeHandle> {
        self.nodes().find(|(_, node)| node.kind == kind && node.name == name).map(|(handle, _)| handle)
    }

    /// Joint names in document order, fixed joints included.
    pub fn joint_names(&self) -> impl Iterator<Item = &str> {
        self.joint_index.keys().map(String::as_str)
    }

    pub fn articulation(&self, joint: &str) -> Option<&Articulation> {
        self.joint_index.get(joint).and_then(|handle| self.articulations.get(handle))
    }

    /// Poses one joint by its canonical name. Values are native units.
    pub fn set_joint_value(&mut self, joint: &str, value: f32) -> Result<(), PoseError> {
        let handle = *self.joint_index.get(joint).ok_or_else(|| PoseError::UnknownJoint(joint.to_string()))?;
        let articulation =
            self.articulations.get_mut(&handle).ok_or_else(|| PoseError::UnknownJoint(joint.to_string()))?;
        let motion = match articulation.kind {
            JointKind::Revolute | JointKind::Continuous => {
                Affine3A::from_quat(Quat::from_axis_angle(articulation.axis, value))
            }
            JointKind::Prismatic => Affine3A::from_translation(articulation.axis * value),
            JointKind::Fixed | JointKind::Floating | JointKind::Planar => {
                return Err(PoseError::NotArticulated(joint.to_string()));
            }
        };
        articulation.value = value;
        self.nodes[handle.index()].motion = motion;
        Ok(())
    }

    pub fn root_transform(&self) -> Mat4 {
        let rotation = Quat::from_euler(EulerRot::XYZ, self.rotation.x, self.rotation.y, self.rotation.z);
        Mat4::from_rotation_translation(rotation, self.position)
    }

    /// World transform of every node, indexed like the arena.
    pub fn world_transforms(&self) -> Vec<Mat4> {
        let root = self.root_transform();
        let mut world: Vec<Mat4> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let parent = node.parent.and_then(|handle| world.get(handle.index()).copied()).unwrap_or(root);
            world.push(parent * Mat4::from(node.origin * node.motion));
        }
        world
    }

    /// Every visual with its world transform.
    pub fn posed_visuals(&self) -> Vec<(Mat4, &Visual)> {
        let world = self.world_transforms();
        self.nodes
            .iter()
            .zip(world)
            .flat_map(|(node, transform)| node.visuals.iter().map(move |visual| (transform * visual.local, visual)))
            .collect()
    }

    /// Geometry and material resources owned by this rig, material arrays expanded.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids = Vec::new();
        for visual in self.nodes.iter().flat_map(|node| node.visuals.iter()) {
            ids.push(visual.geometry.id);
            ids.extend(visual.materials.ids());
        }
        ids
    }
}

/// Builds a rig from a parsed description, resolving each referenced mesh file through `resolve`.
///
/// Files referenced by several visuals are resolved once; the visuals share mesh data but own
/// separate resources.
pub fn build_rig(robot: &UrdfRobot, resolve: &mut dyn FnMut(&str) -> Result<LoadedGeometry>) -> Result<Rig> {
    let root = robot.root_link().ok_or_else(|| anyhow!("robot '{}' has no root link", robot.name))?;
    let mut builder = RigBuilder {
        robot,
        resolve,
        cache: HashMap::new(),
        rig: Rig {
            name: robot.name.clone(),
            nodes: Vec::new(),
            articulations: HashMap::new(),
            joint_index: IndexMap::new(),
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
        },
    };
    builder.add_link(root, None, Affine3A::IDENTITY)?;

    let mut rig = builder.rig;
    let reached = rig.nodes.iter().filter(|node| node.kind == NodeKind::Link).count();
    if reached < robot.links.len() {
        log::warn!("[rig] {}: {} link(s) are not connected to the root", robot.name, robot.links.len() - reached);
    }
    // Document order for joint names.
    let mut ordered = IndexMap::with_capacity(rig.joint_index.len());
    for joint in &robot.joints {
        if let Some(handle) = rig.joint_index.get(&joint.name) {
            ordered.insert(joint.name.clone(), *handle);
        }
    }
    rig.joint_index = ordered;
    Ok(rig)
}

struct RigBuilder<'a> {
    robot: &'a UrdfRobot,
    resolve: &'a mut dyn FnMut(&str) -> Result<LoadedGeometry>,
    cache: HashMap<String, Arc<Vec<(Arc<Mesh>, Mat4, Vec<[f32; 4]>)>>>,
    rig: Rig,
}

impl RigBuilder<'_> {
    fn push(&mut self, node: RigNode) -> NodeHandle {
        let handle = NodeHandle(self.rig.nodes.len() as u32);
        if let Some(parent) = node.parent {
            self.rig.nodes[parent.index()].children.push(handle);
        }
        self.rig.nodes.push(node);
        handle
    }

    fn add_link(&mut self, link: &UrdfLink, parent: Option<NodeHandle>, origin: Affine3A) -> Result<()> {
        if self.rig.find_node(&link.name, NodeKind::Link).is_some() {
            bail!("link '{}' is reachable through more than one joint", link.name);
        }
        let visuals = self.build_visuals(link)?;
        let handle = self.push(RigNode {
            name: link.name.clone(),
            kind: NodeKind::Link,
            parent,
            children: SmallVec::new(),
            origin,
            motion: Affine3A::IDENTITY,
            visuals,
        });

        let robot = self.robot;
        for joint in robot.joints.iter().filter(|joint| joint.parent == link.name) {
            let child = robot
                .link(&joint.child)
                .ok_or_else(|| anyhow!("joint '{}' references unknown link '{}'", joint.name, joint.child))?;
            let joint_handle = self.push(RigNode {
                name: joint.name.clone(),
                kind: NodeKind::Joint,
                parent: Some(handle),
                children: SmallVec::new(),
                origin: joint.origin.to_affine(),
                motion: Affine3A::IDENTITY,
                visuals: Vec::new(),
            });
            self.rig.articulations.insert(
                joint_handle,
                Articulation { kind: joint.kind, axis: joint.axis, limit: joint.limit, value: 0.0 },
            );
            self.rig.joint_index.insert(joint.name.clone(), joint_handle);
            self.add_link(child, Some(joint_handle), Affine3A::IDENTITY)?;
        }
        Ok(())
    }

    fn build_visuals(&mut self, link: &UrdfLink) -> Result<Vec<Visual>> {
        let mut visuals = Vec::new();
        for visual in &link.visuals {
            let origin = Mat4::from(visual.origin.to_affine());
            let pieces = match &visual.geometry {
                UrdfGeometry::Mesh { filename, scale } => {
                    let parts = self.resolve_file(filename)?;
                    let scale = Mat4::from_scale(*scale);
                    parts.iter().map(|(mesh, transform, colors)| (mesh.clone(), scale * *transform, colors.clone())).collect()
                }
                UrdfGeometry::Box { size } => vec![(Arc::new(Mesh::cuboid(*size)), Mat4::IDENTITY, Vec::new())],
                UrdfGeometry::Cylinder { radius, length } => {
                    vec![(Arc::new(Mesh::cylinder(*radius, *length)), Mat4::IDENTITY, Vec::new())]
                }
                UrdfGeometry::Sphere { radius } => vec![(Arc::new(Mesh::sphere(*radius)), Mat4::IDENTITY, Vec::new())],
            };
            for (mesh, transform, colors) in pieces {
                let materials = match visual.color {
                    Some(color) => MaterialSlot::from_colors(&vec![color; mesh.material_slots().max(1)]),
                    None => MaterialSlot::from_colors(&colors),
                };
                visuals.push(Visual { geometry: Geometry::new(mesh), materials, local: origin * transform });
            }
        }
        Ok(visuals)
    }

    fn resolve_file(&mut self, filename: &str) -> Result<Arc<Vec<(Arc<Mesh>, Mat4, Vec<[f32; 4]>)>>> {
        if let Some(parts) = self.cache.get(filename) {
            return Ok(parts.clone());
        }
        let loaded = (self.resolve)(filename)?;
        let parts: Arc<Vec<_>> = Arc::new(
            loaded.parts.into_iter().map(|part| (Arc::new(part.mesh), part.transform, part.colors)).collect(),
        );
        self.cache.insert(filename.to_string(), parts.clone());
        Ok(parts)
    }
}
