//! URDF robot description parsing.
//!
//! Produces a plain data model of links, visuals and joints. Collision and inertial blocks are
//! ignored; the viewer only needs what it draws and what it articulates.

use std::collections::HashMap;

use glam::{Affine3A, EulerRot, Quat, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::xml::{self, XmlElement, XmlError};

#[derive(Debug, Error)]
pub enum UrdfError {
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error("root element is <{0}>, expected <robot>")]
    NotARobot(String),
    #[error("missing attribute '{attribute}' on <{element}>")]
    MissingAttribute { attribute: &'static str, element: String },
    #[error("missing <{child}> in {context}")]
    MissingElement { child: &'static str, context: String },
    #[error("invalid value '{value}' for '{attribute}'")]
    InvalidValue { attribute: &'static str, value: String },
    #[error("unknown joint type '{0}'")]
    UnknownJointType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JointKind {
    Revolute,
    Continuous,
    Prismatic,
    Fixed,
    Floating,
    Planar,
}

impl JointKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "revolute" => Some(Self::Revolute),
            "continuous" => Some(Self::Continuous),
            "prismatic" => Some(Self::Prismatic),
            "fixed" => Some(Self::Fixed),
            "floating" => Some(Self::Floating),
            "planar" => Some(Self::Planar),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Revolute => "revolute",
            Self::Continuous => "continuous",
            Self::Prismatic => "prismatic",
            Self::Fixed => "fixed",
            Self::Floating => "floating",
            Self::Planar => "planar",
        }
    }

    /// Whether values are angles (radians natively) rather than distances.
    pub fn is_angular(self) -> bool {
        matches!(self, Self::Revolute | Self::Continuous)
    }
}

/// `xyz` translation plus fixed-axis roll/pitch/yaw rotation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Origin {
    pub xyz: Vec3,
    pub rpy: Vec3,
}

impl Origin {
    pub fn rotation(&self) -> Quat {
        Quat::from_euler(EulerRot::ZYX, self.rpy.z, self.rpy.y, self.rpy.x)
    }

    pub fn to_affine(&self) -> Affine3A {
        Affine3A::from_rotation_translation(self.rotation(), self.xyz)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UrdfGeometry {
    Mesh { filename: String, scale: Vec3 },
    Box { size: Vec3 },
    Cylinder { radius: f32, length: f32 },
    Sphere { radius: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UrdfVisual {
    pub name: Option<String>,
    pub origin: Origin,
    pub geometry: UrdfGeometry,
    /// Linear RGBA, resolved from an inline color or a robot-level material.
    pub color: Option<[f32; 4]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UrdfLink {
    pub name: String,
    pub visuals: Vec<UrdfVisual>,
}

/// Native limits as declared. Missing attributes stay `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UrdfLimit {
    pub lower: Option<f32>,
    pub upper: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UrdfJoint {
    pub name: String,
    pub kind: JointKind,
    pub parent: String,
    pub child: String,
    pub origin: Origin,
    pub axis: Vec3,
    pub limit: Option<UrdfLimit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UrdfRobot {
    pub name: String,
    pub links: Vec<UrdfLink>,
    pub joints: Vec<UrdfJoint>,
}

impl UrdfRobot {
    pub fn link(&self, name: &str) -> Option<&UrdfLink> {
        self.links.iter().find(|link| link.name == name)
    }

    /// The link that is no joint's child. First in document order when several qualify.
    pub fn root_link(&self) -> Option<&UrdfLink> {
        self.links.iter().find(|link| !self.joints.iter().any(|joint| joint.child == link.name))
    }

    /// Mesh file references in document order, duplicates kept.
    pub fn mesh_references(&self) -> impl Iterator<Item = &str> {
        self.links.iter().flat_map(|link| link.visuals.iter()).filter_map(|visual| match &visual.geometry {
            UrdfGeometry::Mesh { filename, .. } => Some(filename.as_str()),
            _ => None,
        })
    }
}

pub fn parse_urdf(bytes: &[u8]) -> Result<UrdfRobot, UrdfError> {
    let root = xml::parse_document(bytes)?;
    if root.name != "robot" {
        return Err(UrdfError::NotARobot(root.name));
    }
    let name = root.attr("name").unwrap_or_default().to_string();

    let mut materials = HashMap::new();
    for material in root.children_named("material") {
        if let (Some(name), Some(color)) = (material.attr("name"), material_color(material)?) {
            materials.insert(name.to_string(), color);
        }
    }

    let links = root.children_named("link").map(|link| parse_link(link, &materials)).collect::<Result<_, _>>()?;
    let joints = root.children_named("joint").map(parse_joint).collect::<Result<_, _>>()?;
    Ok(UrdfRobot { name, links, joints })
}

fn parse_link(element: &XmlElement, materials: &HashMap<String, [f32; 4]>) -> Result<UrdfLink, UrdfError> {
    let name = required_attr(element, "name")?.to_string();
    let mut visuals = Vec::new();
    for visual in element.children_named("visual") {
        let geometry_element = visual
            .child("geometry")
            .ok_or_else(|| UrdfError::MissingElement { child: "geometry", context: format!("visual of link '{name}'") })?;
        let geometry = parse_geometry(geometry_element, &name)?;
        let origin = visual.child("origin").map(parse_origin).transpose()?.unwrap_or_default();
        let color = match visual.child("material") {
            Some(material) => match material_color(material)? {
                Some(color) => Some(color),
                None => material.attr("name").and_then(|key| materials.get(key).copied()),
            },
            None => None,
        };
        visuals.push(UrdfVisual { name: visual.attr("name").map(str::to_string), origin, geometry, color });
    }
    Ok(UrdfLink { name, visuals })
}

fn parse_geometry(element: &XmlElement, link: &str) -> Result<UrdfGeometry, UrdfError> {
    for shape in &element.children {
        let geometry = match shape.name.as_str() {
            "mesh" => UrdfGeometry::Mesh {
                filename: required_attr(shape, "filename")?.to_string(),
                scale: shape.attr("scale").map(|value| parse_vec3("scale", value)).transpose()?.unwrap_or(Vec3::ONE),
            },
            "box" => UrdfGeometry::Box { size: parse_vec3("size", required_attr(shape, "size")?)? },
            "cylinder" => UrdfGeometry::Cylinder {
                radius: parse_float("radius", required_attr(shape, "radius")?)?,
                length: parse_float("length", required_attr(shape, "length")?)?,
            },
            "sphere" => UrdfGeometry::Sphere { radius: parse_float("radius", required_attr(shape, "radius")?)? },
            _ => continue,
        };
        return Ok(geometry);
    }
    Err(UrdfError::MissingElement { child: "mesh", context: format!("geometry of link '{link}'") })
}

fn parse_joint(element: &XmlElement) -> Result<UrdfJoint, UrdfError> {
    let name = required_attr(element, "name")?.to_string();
    let kind_value = required_attr(element, "type")?;
    let kind = JointKind::parse(kind_value).ok_or_else(|| UrdfError::UnknownJointType(kind_value.to_string()))?;
    let link_of = |child: &'static str| -> Result<String, UrdfError> {
        let element = element
            .child(child)
            .ok_or_else(|| UrdfError::MissingElement { child, context: format!("joint '{name}'") })?;
        Ok(required_attr(element, "link")?.to_string())
    };
    let parent = link_of("parent")?;
    let child = link_of("child")?;
    let origin = element.child("origin").map(parse_origin).transpose()?.unwrap_or_default();
    let axis = match element.child("axis").and_then(|axis| axis.attr("xyz")) {
        Some(value) => parse_vec3("xyz", value)?.normalize_or_zero(),
        None => Vec3::Z,
    };
    let limit = element
        .child("limit")
        .map(|limit| -> Result<UrdfLimit, UrdfError> {
            Ok(UrdfLimit {
                lower: limit.attr("lower").map(|value| parse_float("lower", value)).transpose()?,
                upper: limit.attr("upper").map(|value| parse_float("upper", value)).transpose()?,
            })
        })
        .transpose()?;
    Ok(UrdfJoint { name, kind, parent, child, origin, axis, limit })
}

fn parse_origin(element: &XmlElement) -> Result<Origin, UrdfError> {
    let xyz = element.attr("xyz").map(|value| parse_vec3("xyz", value)).transpose()?.unwrap_or(Vec3::ZERO);
    let rpy = element.attr("rpy").map(|value| parse_vec3("rpy", value)).transpose()?.unwrap_or(Vec3::ZERO);
    Ok(Origin { xyz, rpy })
}

fn material_color(material: &XmlElement) -> Result<Option<[f32; 4]>, UrdfError> {
    let Some(rgba) = material.child("color").and_then(|color| color.attr("rgba")) else {
        return Ok(None);
    };
    match xml::parse_floats(rgba).as_deref() {
        Some([r, g, b, a]) => Ok(Some([*r, *g, *b, *a])),
        Some([r, g, b]) => Ok(Some([*r, *g, *b, 1.0])),
        _ => Err(UrdfError::InvalidValue { attribute: "rgba", value: rgba.to_string() }),
    }
}

fn required_attr<'a>(element: &'a XmlElement, attribute: &'static str) -> Result<&'a str, UrdfError> {
    element.attr(attribute).ok_or_else(|| UrdfError::MissingAttribute { attribute, element: element.name.clone() })
}

fn parse_float(attribute: &'static str, value: &str) -> Result<f32, UrdfError> {
    value.trim().parse().map_err(|_| UrdfError::InvalidValue { attribute, value: value.to_string() })
}

fn parse_vec3(attribute: &'static str, value: &str) -> Result<Vec3, UrdfError> {
    match xml::parse_floats(value).as_deref() {
        Some([x, y, z]) => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(UrdfError::InvalidValue { attribute, value: value.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARM: &str = r#"<?xml version="1.0"?>
<robot name="two_link_arm">
  <material name="orange"><color rgba="1 0.5 0 1"/></material>
  <link name="base_link">
    <visual>
      <geometry><box size="0.2 0.2 0.1"/></geometry>
      <material name="orange"/>
    </visual>
    <collision><geometry><box size="0.2 0.2 0.1"/></geometry></collision>
  </link>
  <link name="upper_arm">
    <visual>
      <origin xyz="0 0 0.25" rpy="0 0 0"/>
      <geometry><mesh filename="package://arm/meshes/upper_arm.stl" scale="0.001 0.001 0.001"/></geometry>
      <material name="grey"><color rgba="0.5 0.5 0.5 1"/></material>
    </visual>
  </link>
  <link name="tool"/>
  <joint name="shoulder" type="revolute">
    <parent link="base_link"/>
    <child link="upper_arm"/>
    <origin xyz="0 0 0.05" rpy="0 0 1.5707963"/>
    <axis xyz="0 1 0"/>
    <limit lower="-1.5707963" upper="1.5707963" effort="10" velocity="1"/>
  </joint>
  <joint name="wrist" type="continuous">
    <parent link="upper_arm"/>
    <child link="tool"/>
  </joint>
</robot>"#;

    #[test]
    fn parses_links_joints_and_materials() {
        let robot = parse_urdf(ARM.as_bytes()).expect("parse arm");
        assert_eq!(robot.name, "two_link_arm");
        assert_eq!(robot.links.len(), 3);
        assert_eq!(robot.joints.len(), 2);

        let base = robot.link("base_link").expect("base");
        assert_eq!(base.visuals[0].geometry, UrdfGeometry::Box { size: Vec3::new(0.2, 0.2, 0.1) });
        assert_eq!(base.visuals[0].color, Some([1.0, 0.5, 0.0, 1.0]));

        let upper = robot.link("upper_arm").expect("upper arm");
        assert_eq!(upper.visuals[0].color, Some([0.5, 0.5, 0.5, 1.0]));
        match &upper.visuals[0].geometry {
            UrdfGeometry::Mesh { filename, scale } => {
                assert_eq!(filename, "package://arm/meshes/upper_arm.stl");
                assert!((scale.x - 0.001).abs() < 1e-6);
            }
            other => panic!("unexpected geometry {other:?}"),
        }

        let shoulder = &robot.joints[0];
        assert_eq!(shoulder.kind, JointKind::Revolute);
        assert_eq!(shoulder.axis, Vec3::Y);
        let limit = shoulder.limit.expect("limit");
        assert!((limit.lower.expect("lower") + 1.5707963).abs() < 1e-6);

        let wrist = &robot.joints[1];
        assert_eq!(wrist.kind, JointKind::Continuous);
        assert_eq!(wrist.axis, Vec3::Z);
        assert!(wrist.limit.is_none());
    }

    #[test]
    fn finds_root_and_mesh_references() {
        let robot = parse_urdf(ARM.as_bytes()).expect("parse arm");
        assert_eq!(robot.root_link().map(|link| link.name.as_str()), Some("base_link"));
        let meshes: Vec<_> = robot.mesh_references().collect();
        assert_eq!(meshes, vec!["package://arm/meshes/upper_arm.stl"]);
    }

    #[test]
    fn rpy_uses_fixed_axis_convention() {
        let origin = Origin { xyz: Vec3::ZERO, rpy: Vec3::new(0.0, 0.0, std::f32::consts::FRAC_PI_2) };
        let rotated = origin.rotation() * Vec3::X;
        assert!((rotated - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn rejects_unknown_joint_type_and_wrong_root() {
        let bad_joint = r#"<robot name="r"><link name="a"/><link name="b"/>
            <joint name="j" type="hinge"><parent link="a"/><child link="b"/></joint></robot>"#;
        assert!(matches!(parse_urdf(bad_joint.as_bytes()), Err(UrdfError::UnknownJointType(kind)) if kind == "hinge"));
        assert!(matches!(parse_urdf(b"<scene/>"), Err(UrdfError::NotARobot(_))));
    }

    #[test]
    fn missing_joint_parent_is_reported() {
        let doc = r#"<robot name="r"><link name="a"/><joint name="j" type="fixed"><child link="a"/></joint></robot>"#;
        let err = parse_urdf(doc.as_bytes()).expect_err("missing parent");
        assert!(err.to_string().contains("parent"));
    }
}
