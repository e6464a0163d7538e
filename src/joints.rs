//! Joint state, name aliasing and validated posing of active rigs.

use glam::Vec3;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ViewerError, ViewerResult};
use crate::lifecycle::Viewer;
use crate::rig::Rig;
use crate::scene::Scene;
use crate::urdf::{JointKind, UrdfLimit};

/// Display-unit bound used when a joint declares no limit.
pub const DEFAULT_LIMIT_DEGREES: f32 = 180.0;

/// Gives the controller access to the live rigs it poses.
pub trait RigHost {
    fn rig_mut(&mut self, robot_id: &str) -> Option<&mut Rig>;
}

impl RigHost for Viewer {
    fn rig_mut(&mut self, robot_id: &str) -> Option<&mut Rig> {
        Viewer::rig_mut(self, robot_id)
    }
}

impl RigHost for Scene {
    fn rig_mut(&mut self, robot_id: &str) -> Option<&mut Rig> {
        Scene::rig_mut(self, robot_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    pub lower: f32,
    pub upper: f32,
}

impl JointLimits {
    pub fn contains(&self, value: f32) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Joint state in display units: degrees for angular joints, native units for prismatic ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Joint {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: JointKind,
    pub angle: f32,
    pub limits: JointLimits,
}

impl Joint {
    fn from_native(name: &str, kind: JointKind, limit: Option<UrdfLimit>) -> Self {
        let limits = if kind == JointKind::Continuous {
            JointLimits { lower: -DEFAULT_LIMIT_DEGREES, upper: DEFAULT_LIMIT_DEGREES }
        } else {
            let limit = limit.unwrap_or_default();
            let to_display = |value: f32| if kind.is_angular() { value.to_degrees() } else { value };
            JointLimits {
                lower: limit.lower.map(to_display).unwrap_or(-DEFAULT_LIMIT_DEGREES),
                upper: limit.upper.map(to_display).unwrap_or(DEFAULT_LIMIT_DEGREES),
            }
        };
        Self { name: name.to_string(), kind, angle: 0.0, limits }
    }

    /// Display value converted to the rig's native unit.
    fn native_value(&self, value: f32) -> f32 {
        if self.kind.is_angular() {
            value.to_radians()
        } else {
            value
        }
    }
}

/// `canonical → alias` with lookup in both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointAliasMap {
    forward: IndexMap<String, String>,
}

impl JointAliasMap {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self { forward: entries.into_iter().collect() }
    }

    pub fn alias_of(&self, canonical: &str) -> Option<&str> {
        self.forward.get(canonical).map(String::as_str)
    }

    /// Every canonical name mapped to `alias`.
    pub fn canonicals_for<'a>(&'a self, alias: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.forward.iter().filter(move |(_, value)| value.as_str() == alias).map(|(key, _)| key.as_str())
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn set(self, target: &mut Vec3, value: f32) {
        match self {
            Axis::X => target.x = value,
            Axis::Y => target.y = value,
            Axis::Z => target.z = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AxisValues {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl From<Vec3> for AxisValues {
    fn from(value: Vec3) -> Self {
        Self { x: value.x, y: value.y, z: value.z }
    }
}

/// One entry of a bulk update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JointTarget {
    pub joint_name: String,
    pub angle: f32,
}

/// Result of a successful single-joint update.
#[derive(Debug, Clone, PartialEq)]
pub struct JointUpdate {
    pub canonical: String,
    pub angle: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotSnapshot {
    pub robot_id: String,
    pub name: String,
    pub joints: Vec<Joint>,
    pub position: AxisValues,
    /// Radians.
    pub rotation: AxisValues,
}

#[derive(Debug, Clone)]
struct RobotJoints {
    name: String,
    joints: IndexMap<String, Joint>,
    aliases: JointAliasMap,
    position: Vec3,
    rotation: Vec3,
}

impl RobotJoints {
    fn resolve(&self, name: &str) -> Option<String> {
        if self.joints.contains_key(name) {
            return Some(name.to_string());
        }
        self.aliases.canonicals_for(name).find(|canonical| self.joints.contains_key(*canonical)).map(str::to_string)
    }

    /// Bulk-path matches: canonical name, then forward alias, then every reverse alias.
    fn bulk_matches(&self, name: &str) -> Vec<String> {
        if self.joints.contains_key(name) {
            return vec![name.to_string()];
        }
        if let Some(alias) = self.aliases.alias_of(name).filter(|alias| self.joints.contains_key(*alias)) {
            return vec![alias.to_string()];
        }
        self.aliases
            .canonicals_for(name)
            .filter(|canonical| self.joints.contains_key(*canonical))
            .map(str::to_string)
            .collect()
    }
}

/// Joint state of every active robot, in activation order.
#[derive(Debug, Default)]
pub struct JointController {
    robots: IndexMap<String, RobotJoints>,
}

impl JointController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a freshly activated rig: angles at zero, limits in display units.
    pub fn register(&mut self, robot_id: &str, name: &str, rig: &Rig) -> Vec<Joint> {
        let joints: IndexMap<String, Joint> = rig
            .joint_names()
            .filter_map(|joint| {
                let articulation = rig.articulation(joint)?;
                matches!(articulation.kind, JointKind::Revolute | JointKind::Continuous | JointKind::Prismatic)
                    .then(|| (joint.to_string(), Joint::from_native(joint, articulation.kind, articulation.limit)))
            })
            .collect();
        let list = joints.values().cloned().collect();
        self.robots.insert(
            robot_id.to_string(),
            RobotJoints {
                name: name.to_string(),
                joints,
                aliases: JointAliasMap::default(),
                position: Vec3::ZERO,
                rotation: Vec3::ZERO,
            },
        );
        list
    }

    /// Drops the robot's joints and alias map.
    pub fn unregister(&mut self, robot_id: &str) -> bool {
        self.robots.shift_remove(robot_id).is_some()
    }

    pub fn is_active(&self, robot_id: &str) -> bool {
        self.robots.contains_key(robot_id)
    }

    pub fn robot_ids(&self) -> impl Iterator<Item = &str> {
        self.robots.keys().map(String::as_str)
    }

    pub fn joints(&self, robot_id: &str) -> Option<Vec<Joint>> {
        self.robots.get(robot_id).map(|robot| robot.joints.values().cloned().collect())
    }

    pub fn joint(&self, robot_id: &str, joint_name: &str) -> Option<&Joint> {
        self.robots.get(robot_id)?.joints.get(joint_name)
    }

    /// Validates and applies one angle. The stored angle is untouched on error.
    pub fn set_joint_angle(
        &mut self,
        host: &mut dyn RigHost,
        robot_id: &str,
        joint_name: &str,
        angle: f32,
    ) -> ViewerResult<JointUpdate> {
        let robot = self.robots.get_mut(robot_id).ok_or_else(|| ViewerError::RobotNotFound(robot_id.to_string()))?;
        let canonical = robot.resolve(joint_name).ok_or_else(|| ViewerError::JointNotFound(joint_name.to_string()))?;
        let joint = robot.joints.get_mut(&canonical).ok_or_else(|| ViewerError::JointNotFound(joint_name.to_string()))?;
        if !joint.limits.contains(angle) {
            return Err(ViewerError::OutOfLimits {
                joint: joint_name.to_string(),
                angle,
                lower: joint.limits.lower,
                upper: joint.limits.upper,
            });
        }
        joint.angle = angle;
        let native = joint.native_value(angle);
        if let Some(rig) = host.rig_mut(robot_id) {
            pose(rig, joint_name, &canonical, native);
        }
        Ok(JointUpdate { canonical, angle })
    }

    /// Applies each target to every active robot that knows the joint. Unknown or out-of-limit
    /// entries are skipped. Returns the number of joints updated.
    pub fn set_joint_angles(&mut self, host: &mut dyn RigHost, updates: &[JointTarget]) -> usize {
        let mut updated = 0;
        for update in updates {
            let mut matched = false;
            for (robot_id, robot) in self.robots.iter_mut() {
                for canonical in robot.bulk_matches(&update.joint_name) {
                    matched = true;
                    let Some(joint) = robot.joints.get_mut(&canonical) else { continue };
                    if !joint.limits.contains(update.angle) {
                        log::warn!(
                            "[joints] {robot_id}: {} angle {} outside [{}, {}], skipped",
                            canonical,
                            update.angle,
                            joint.limits.lower,
                            joint.limits.upper
                        );
                        continue;
                    }
                    joint.angle = update.angle;
                    let native = joint.native_value(update.angle);
                    if let Some(rig) = host.rig_mut(robot_id) {
                        pose(rig, &canonical, &canonical, native);
                    }
                    updated += 1;
                }
            }
            if !matched {
                log::warn!("[joints] no active robot has a joint or alias named '{}'", update.joint_name);
            }
        }
        updated
    }

    /// Replaces the robot's alias map wholesale.
    pub fn set_alias_map(&mut self, robot_id: &str, aliases: JointAliasMap) -> ViewerResult<()> {
        let robot = self.robots.get_mut(robot_id).ok_or_else(|| ViewerError::RobotNotFound(robot_id.to_string()))?;
        robot.aliases = aliases;
        Ok(())
    }

    pub fn alias_map(&self, robot_id: &str) -> Option<&JointAliasMap> {
        self.robots.get(robot_id).map(|robot| &robot.aliases)
    }

    pub fn set_position(&mut self, host: &mut dyn RigHost, robot_id: &str, axis: Axis, value: Option<f32>) {
        let (Some(value), Some(robot)) = (value, self.robots.get_mut(robot_id)) else { return };
        axis.set(&mut robot.position, value);
        if let Some(rig) = host.rig_mut(robot_id) {
            rig.position = robot.position;
        }
    }

    /// `degrees` is converted to radians before it reaches the rig.
    pub fn set_rotation(&mut self, host: &mut dyn RigHost, robot_id: &str, axis: Axis, degrees: Option<f32>) {
        let (Some(degrees), Some(robot)) = (degrees, self.robots.get_mut(robot_id)) else { return };
        axis.set(&mut robot.rotation, degrees.to_radians());
        if let Some(rig) = host.rig_mut(robot_id) {
            rig.rotation = robot.rotation;
        }
    }

    pub fn snapshot(&self) -> Vec<RobotSnapshot> {
        self.robots
            .iter()
            .map(|(robot_id, robot)| RobotSnapshot {
                robot_id: robot_id.clone(),
                name: robot.name.clone(),
                joints: robot.joints.values().cloned().collect(),
                position: robot.position.into(),
                rotation: robot.rotation.into(),
            })
            .collect()
    }
}

/// Poses by the given name, retrying with the canonical name when the rig rejects it.
fn pose(rig: &mut Rig, given: &str, canonical: &str, native: f32) {
    if rig.set_joint_value(given, native).is_ok() {
        return;
    }
    if let Err(err) = rig.set_joint_value(canonical, native) {
        log::warn!("[joints] could not pose '{given}' on rig {}: {err}", rig.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::LoadedGeometry;
    use crate::rig::build_rig;
    use crate::scene::Color;
    use crate::urdf::parse_urdf;

    const ARM: &str = r#"<robot name="arm">
  <link name="base"/><link name="upper"/><link name="lower"/><link name="tool"/><link name="wheel"/>
  <joint name="shoulder" type="revolute">
    <parent link="base"/><child link="upper"/><limit lower="-1.5707963" upper="1.5707963"/>
  </joint>
  <joint name="elbow" type="revolute">
    <parent link="upper"/><child link="lower"/><limit lower="-0.5"/>
  </joint>
  <joint name="mount" type="fixed"><parent link="lower"/><child link="tool"/></joint>
  <joint name="spin" type="continuous">
    <parent link="base"/><child link="wheel"/><limit lower="-1" upper="1"/>
  </joint>
</robot>"#;

    fn setup() -> (JointController, Scene) {
        let robot = parse_urdf(ARM.as_bytes()).expect("parse arm");
        let rig = build_rig(&robot, &mut |_: &str| Ok(LoadedGeometry::default())).expect("build arm");
        let mut controller = JointController::new();
        controller.register("r1", "arm", &rig);
        let mut scene = Scene::new(Color::from_hex(0));
        scene.insert_rig("r1", rig);
        (controller, scene)
    }

    #[test]
    fn registration_converts_limits_and_skips_fixed_joints() {
        let (controller, _) = setup();
        let joints = controller.joints("r1").expect("joints");
        let names: Vec<_> = joints.iter().map(|joint| joint.name.as_str()).collect();
        assert_eq!(names, vec!["shoulder", "elbow", "spin"]);

        let shoulder = &joints[0];
        assert!((shoulder.limits.lower + 90.0).abs() < 1e-3 && (shoulder.limits.upper - 90.0).abs() < 1e-3);
        assert!((joints[1].limits.lower + 28.6479).abs() < 1e-3);
        assert_eq!(joints[1].limits.upper, 180.0);
        assert_eq!(joints[2].limits, JointLimits { lower: -180.0, upper: 180.0 });
        assert!(joints.iter().all(|joint| joint.angle == 0.0));
    }

    #[test]
    fn out_of_limit_angles_are_rejected_not_clamped() {
        let (mut controller, mut scene) = setup();
        let update = controller.set_joint_angle(&mut scene, "r1", "shoulder", 45.0).expect("in range");
        assert_eq!(update.angle, 45.0);

        let err = controller.set_joint_angle(&mut scene, "r1", "shoulder", 120.0).expect_err("out of range");
        assert!(matches!(err, ViewerError::OutOfLimits { .. }));
        assert_eq!(controller.joint("r1", "shoulder").map(|joint| joint.angle), Some(45.0));
        let native = scene.rig("r1").and_then(|rig| rig.articulation("shoulder")).map(|a| a.value);
        assert!((native.expect("articulation") - 45f32.to_radians()).abs() < 1e-6);
    }

    #[test]
    fn unknown_robot_and_joint_are_not_found() {
        let (mut controller, mut scene) = setup();
        let err = controller.set_joint_angle(&mut scene, "nope", "shoulder", 0.0).expect_err("robot");
        assert_eq!(err.to_string(), "Robot nope not found");
        let err = controller.set_joint_angle(&mut scene, "r1", "wrist", 0.0).expect_err("joint");
        assert_eq!(err.joint_name(), Some("wrist"));
    }

    #[test]
    fn reverse_alias_reaches_canonical_joint() {
        let (mut controller, mut scene) = setup();
        controller
            .set_alias_map("r1", JointAliasMap::new([("elbow".to_string(), "left_elbow_CMC".to_string())]))
            .expect("alias map");
        let update = controller.set_joint_angle(&mut scene, "r1", "left_elbow_CMC", 30.0).expect("alias update");
        assert_eq!(update.canonical, "elbow");
        assert_eq!(controller.joint("r1", "elbow").map(|joint| joint.angle), Some(30.0));
        let native = scene.rig("r1").and_then(|rig| rig.articulation("elbow")).map(|a| a.value);
        assert!((native.expect("articulation") - 30f32.to_radians()).abs() < 1e-6);
    }

    #[test]
    fn alias_maps_are_replaced_wholesale() {
        let (mut controller, _) = setup();
        controller.set_alias_map("r1", JointAliasMap::new([("elbow".into(), "a".into())])).expect("first");
        controller.set_alias_map("r1", JointAliasMap::new([("shoulder".into(), "b".into())])).expect("second");
        let aliases = controller.alias_map("r1").expect("aliases");
        assert_eq!(aliases.alias_of("elbow"), None);
        assert_eq!(aliases.alias_of("shoulder"), Some("b"));
    }

    #[test]
    fn bulk_updates_skip_bad_entries() {
        let (mut controller, mut scene) = setup();
        let updates = [
            JointTarget { joint_name: "shoulder".into(), angle: 10.0 },
            JointTarget { joint_name: "elbow".into(), angle: -90.0 },
            JointTarget { joint_name: "ghost".into(), angle: 1.0 },
        ];
        assert_eq!(controller.set_joint_angles(&mut scene, &updates), 1);
        assert_eq!(controller.joint("r1", "shoulder").map(|joint| joint.angle), Some(10.0));
        assert_eq!(controller.joint("r1", "elbow").map(|joint| joint.angle), Some(0.0));
    }

    #[test]
    fn root_pose_converts_rotation_and_ignores_missing_values() {
        let (mut controller, mut scene) = setup();
        controller.set_position(&mut scene, "r1", Axis::Y, Some(2.0));
        controller.set_position(&mut scene, "r1", Axis::X, None);
        controller.set_rotation(&mut scene, "r1", Axis::Z, Some(90.0));
        controller.set_rotation(&mut scene, "ghost", Axis::Z, Some(90.0));

        let rig = scene.rig("r1").expect("rig");
        assert_eq!(rig.position, Vec3::new(0.0, 2.0, 0.0));
        assert!((rig.rotation.z - std::f32::consts::FRAC_PI_2).abs() < 1e-6);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].position, AxisValues { x: 0.0, y: 2.0, z: 0.0 });
        let json = serde_json::to_value(&snapshot[0]).expect("serialize");
        assert_eq!(json["robotId"], "r1");
        assert_eq!(json["joints"][0]["type"], "revolute");
    }
}
