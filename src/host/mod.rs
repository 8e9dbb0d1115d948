//! The host application seen from the tools' side.
//!
//! [`HostOperations`] is the capability every host-affinity tool reaches
//! through [`ToolContext::host`](crate::scheduler::ToolContext::host). Its
//! methods assume they run on the host thread; the scheduler guarantees it.
//!
//! [`scene::SceneHost`] is a headless in-memory implementation used by the
//! standalone binary and the tests. [`HostLoop`] drives a scheduler on a
//! dedicated thread for hosts that do not provide a timer of their own.

mod runner;
pub mod scene;
pub mod tools;

pub use runner::HostLoop;

use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// A 3-component vector (x, y, z).
pub type Vec3 = [f64; 3];

/// Kind of scene object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectKind {
    /// Unit cube mesh.
    Cube,
    /// UV sphere mesh.
    Sphere,
    /// Cylinder mesh.
    Cylinder,
    /// Single-quad plane mesh.
    Plane,
    /// Cone mesh.
    Cone,
    /// Torus mesh.
    Torus,
    /// Empty (no geometry).
    Empty,
    /// Camera.
    Camera,
    /// Light.
    Light,
    /// Text object.
    Text,
}

impl ObjectKind {
    /// Base name given to new objects of this kind.
    #[must_use]
    pub const fn default_name(self) -> &'static str {
        match self {
            Self::Cube => "Cube",
            Self::Sphere => "Sphere",
            Self::Cylinder => "Cylinder",
            Self::Plane => "Plane",
            Self::Cone => "Cone",
            Self::Torus => "Torus",
            Self::Empty => "Empty",
            Self::Camera => "Camera",
            Self::Light => "Light",
            Self::Text => "Text",
        }
    }

    /// Geometry of a freshly created primitive, `None` for non-mesh kinds.
    #[must_use]
    pub const fn primitive_mesh(self) -> Option<MeshStats> {
        let (vertices, edges, polygons) = match self {
            Self::Cube => (8, 12, 6),
            Self::Sphere => (482, 992, 512),
            Self::Cylinder => (64, 96, 34),
            Self::Plane => (4, 4, 1),
            Self::Cone => (33, 64, 33),
            Self::Torus => (576, 1152, 576),
            Self::Empty | Self::Camera | Self::Light | Self::Text => return None,
        };
        Some(MeshStats {
            vertices,
            edges,
            polygons,
        })
    }

    /// Whether objects of this kind carry mesh geometry.
    #[must_use]
    pub const fn is_mesh(self) -> bool {
        self.primitive_mesh().is_some()
    }

    /// Whether objects of this kind have material slots.
    #[must_use]
    pub const fn accepts_materials(self) -> bool {
        self.is_mesh() || matches!(self, Self::Text)
    }
}

/// Kind of light source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LightKind {
    /// Omnidirectional point light.
    #[default]
    Point,
    /// Directional light.
    Sun,
    /// Cone-shaped spot light.
    Spot,
    /// Area light.
    Area,
}

/// Location, rotation (Euler, radians) and scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// World-space location.
    pub location: Vec3,
    /// Euler rotation in radians.
    pub rotation: Vec3,
    /// Per-axis scale.
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            location: [0.0; 3],
            rotation: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

/// Mesh element counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStats {
    /// Vertex count.
    pub vertices: usize,
    /// Edge count.
    pub edges: usize,
    /// Face count.
    pub polygons: usize,
}

/// What to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSpec {
    /// Object kind.
    pub kind: ObjectKind,
    /// Requested name; the kind's default name when `None`.
    pub name: Option<String>,
    /// Initial transform.
    pub transform: Transform,
    /// Light type, for lights.
    pub light: Option<LightKind>,
    /// Body, for text objects.
    pub text: Option<String>,
}

impl ObjectSpec {
    /// A default-placed object of `kind`.
    #[must_use]
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            name: None,
            transform: Transform::default(),
            light: None,
            text: None,
        }
    }

    /// Sets the requested name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the initial transform.
    #[must_use]
    pub const fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }
}

/// Partial update of an object's transform and visibility.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TransformChange {
    /// New location.
    #[serde(default)]
    pub location: Option<Vec3>,
    /// New rotation (radians).
    #[serde(default)]
    pub rotation: Option<Vec3>,
    /// New scale.
    #[serde(default)]
    pub scale: Option<Vec3>,
    /// New visibility.
    #[serde(default)]
    pub visible: Option<bool>,
}

/// Detailed view of one object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectInfo {
    /// Unique object name.
    pub name: String,
    /// Object kind.
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    /// Current transform.
    #[serde(flatten)]
    pub transform: Transform,
    /// Whether the object is visible in viewport and render.
    pub visible: bool,
    /// Names of assigned materials, in slot order.
    pub materials: Vec<String>,
    /// Geometry, for meshes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshStats>,
    /// Light type, for lights.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<LightKind>,
    /// Body, for text objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Total keyframes across all animated properties.
    pub keyframes: usize,
}

/// Short entry in a [`SceneInfo`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectSummary {
    /// Object name.
    pub name: String,
    /// Object kind.
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    /// Location rounded to two decimals.
    pub location: Vec3,
}

/// Overview of the scene.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneInfo {
    /// Scene name.
    pub name: String,
    /// Total object count.
    pub object_count: usize,
    /// The first few objects, in creation order.
    pub objects: Vec<ObjectSummary>,
    /// Number of materials in the scene.
    pub materials_count: usize,
    /// Name of the active camera.
    pub active_camera: Option<String>,
}

/// RGBA colour, components in `0.0..=1.0`.
pub type Color = [f64; 4];

/// Result of assigning a material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterialAssignment {
    /// Object the material went to.
    pub object: String,
    /// Material name.
    pub material: String,
    /// Base colour after the assignment.
    pub color: Option<Color>,
    /// Whether the material was newly created.
    pub created: bool,
}

/// Transform channel that keyframes animate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimatedProperty {
    /// Location.
    Location,
    /// Euler rotation; keyframe values are given in degrees.
    RotationEuler,
    /// Scale.
    Scale,
}

impl AnimatedProperty {
    /// The property name as reported to clients.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::RotationEuler => "rotation_euler",
            Self::Scale => "scale",
        }
    }
}

/// One keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    /// Frame number.
    pub frame: i32,
    /// Value at that frame.
    pub value: Vec3,
}

/// Result of inserting keyframes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyframeReport {
    /// Animated object.
    pub object: String,
    /// Animated property.
    pub property: AnimatedProperty,
    /// Keyframes now on that property.
    pub keyframes: usize,
}

/// Result of joining objects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinReport {
    /// The object the others were merged into.
    pub target_object: String,
    /// How many objects were merged into the target.
    pub joined_objects: usize,
    /// Target geometry after the join.
    pub mesh: MeshStats,
}

/// Render request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RenderSettings {
    /// Where to write the image; not saved when `None`.
    #[serde(default)]
    pub output_path: Option<String>,
    /// Horizontal resolution override.
    #[serde(default)]
    pub resolution_x: Option<u32>,
    /// Vertical resolution override.
    #[serde(default)]
    pub resolution_y: Option<u32>,
}

/// Result of a render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderInfo {
    /// Always `true` on success.
    pub rendered: bool,
    /// Output path, or `"[not saved]"`.
    pub output_path: String,
    /// Resolution used.
    pub resolution: [u32; 2],
    /// Camera rendered from.
    pub camera: String,
}

/// Operations a host application exposes to tools.
///
/// Every method runs on the host thread.
pub trait HostOperations {
    /// Scene overview.
    fn scene_info(&self) -> SceneInfo;

    /// Creates an object and returns its final (possibly deduplicated) state.
    ///
    /// # Errors
    ///
    /// Invalid name or the scene's object limit.
    fn create_object(&mut self, spec: ObjectSpec) -> Result<ObjectInfo, HostError>;

    /// Applies a partial transform/visibility change.
    ///
    /// # Errors
    ///
    /// [`HostError::ObjectNotFound`].
    fn modify_object(&mut self, name: &str, change: &TransformChange)
        -> Result<ObjectInfo, HostError>;

    /// Deletes an object and returns its name.
    ///
    /// # Errors
    ///
    /// [`HostError::ObjectNotFound`].
    fn delete_object(&mut self, name: &str) -> Result<String, HostError>;

    /// Detailed object view.
    ///
    /// # Errors
    ///
    /// [`HostError::ObjectNotFound`].
    fn object_info(&self, name: &str) -> Result<ObjectInfo, HostError>;

    /// Assigns a material to the object's first slot, creating the material
    /// if needed. With no name, `<object>_material` is used.
    ///
    /// # Errors
    ///
    /// Unknown object, or an object without material slots.
    fn set_material(
        &mut self,
        object: &str,
        material: Option<&str>,
        color: Option<Color>,
    ) -> Result<MaterialAssignment, HostError>;

    /// Makes a camera object the scene camera.
    ///
    /// # Errors
    ///
    /// Unknown object or not a camera.
    fn set_active_camera(&mut self, name: &str) -> Result<ObjectInfo, HostError>;

    /// Replaces the keyframes of one property.
    ///
    /// # Errors
    ///
    /// Unknown object or an empty keyframe list.
    fn insert_keyframes(
        &mut self,
        object: &str,
        property: AnimatedProperty,
        keyframes: &[Keyframe],
    ) -> Result<KeyframeReport, HostError>;

    /// Merges mesh objects into one.
    ///
    /// # Errors
    ///
    /// Unknown or non-mesh objects, an empty list, or a target that is not
    /// one of `objects`.
    fn join_objects(&mut self, objects: &[String], target: Option<&str>)
        -> Result<JoinReport, HostError>;

    /// Renders the scene from the active camera.
    ///
    /// # Errors
    ///
    /// No active camera.
    fn render(&mut self, settings: &RenderSettings) -> Result<RenderInfo, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_geometry_kinds_are_meshes() {
        assert!(ObjectKind::Cube.is_mesh());
        assert!(!ObjectKind::Camera.is_mesh());
        assert!(ObjectKind::Text.accepts_materials());
        assert!(!ObjectKind::Light.accepts_materials());
    }

    #[test]
    fn kinds_use_uppercase_wire_names() {
        let kind: ObjectKind = serde_json::from_str("\"SPHERE\"").unwrap();
        assert_eq!(kind, ObjectKind::Sphere);
        assert!(serde_json::from_str::<ObjectKind>("\"sphere\"").is_err());
    }

    #[test]
    fn object_info_flattens_transform() {
        let info = ObjectInfo {
            name: "Cube".into(),
            kind: ObjectKind::Cube,
            transform: Transform::default(),
            visible: true,
            materials: vec![],
            mesh: ObjectKind::Cube.primitive_mesh(),
            light: None,
            text: None,
            keyframes: 0,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["type"], "CUBE");
        assert_eq!(value["scale"], serde_json::json!([1.0, 1.0, 1.0]));
        assert_eq!(value["mesh"]["vertices"], 8);
        assert!(value.get("light").is_none());
    }
}
