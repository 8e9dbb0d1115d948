//! Headless in-memory scene.
//!
//! Behaves like a minimal content-creation host: named objects with
//! transforms, material slots, per-property keyframe curves, an active camera
//! and render settings. Rendering only records the settings it would use.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use regex::Regex;
use tracing::debug;

use super::{
    AnimatedProperty, Color, HostOperations, JoinReport, Keyframe, KeyframeReport, LightKind,
    MaterialAssignment, MeshStats, ObjectInfo, ObjectKind, ObjectSpec, ObjectSummary,
    RenderInfo, RenderSettings, SceneInfo, Transform, TransformChange,
};
use crate::config::SceneConfig;
use crate::error::HostError;

/// Objects listed in a scene overview.
const SUMMARY_LIMIT: usize = 10;

const DEFAULT_RESOLUTION: [u32; 2] = [1920, 1080];

#[derive(Debug, Clone)]
struct SceneObject {
    kind: ObjectKind,
    transform: Transform,
    visible: bool,
    materials: Vec<String>,
    mesh: Option<MeshStats>,
    light: Option<LightKind>,
    text: Option<String>,
    curves: BTreeMap<AnimatedProperty, Vec<Keyframe>>,
}

#[derive(Debug, Clone)]
struct Material {
    color: Option<Color>,
}

/// An in-memory scene implementing [`HostOperations`].
#[derive(Debug)]
pub struct SceneHost {
    name: String,
    objects: IndexMap<String, SceneObject>,
    materials: IndexMap<String, Material>,
    active_camera: Option<String>,
    resolution: [u32; 2],
    max_objects: usize,
    name_pattern: Regex,
}

impl SceneHost {
    /// Creates an empty scene with the given limits.
    ///
    /// # Errors
    ///
    /// [`HostError::Failed`] if the configured name pattern does not compile.
    pub fn new(config: &SceneConfig) -> Result<Self, HostError> {
        let name_pattern = Regex::new(&config.object_name_pattern)
            .map_err(|e| HostError::Failed(format!("invalid object name pattern: {e}")))?;
        Ok(Self {
            name: "Scene".to_string(),
            objects: IndexMap::new(),
            materials: IndexMap::new(),
            active_camera: None,
            resolution: DEFAULT_RESOLUTION,
            max_objects: config.max_objects,
            name_pattern,
        })
    }

    /// Number of objects in the scene.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn object(&self, name: &str) -> Result<&SceneObject, HostError> {
        self.objects
            .get(name)
            .ok_or_else(|| HostError::ObjectNotFound(name.to_string()))
    }

    fn object_mut(&mut self, name: &str) -> Result<&mut SceneObject, HostError> {
        self.objects
            .get_mut(name)
            .ok_or_else(|| HostError::ObjectNotFound(name.to_string()))
    }

    fn info(&self, name: &str) -> Result<ObjectInfo, HostError> {
        let obj = self.object(name)?;
        Ok(ObjectInfo {
            name: name.to_string(),
            kind: obj.kind,
            transform: obj.transform,
            visible: obj.visible,
            materials: obj.materials.clone(),
            mesh: obj.mesh,
            light: obj.light,
            text: obj.text.clone(),
            keyframes: obj.curves.values().map(Vec::len).sum(),
        })
    }

    /// Returns `requested` if free, otherwise the first free `base.NNN`.
    fn unique_name(&self, requested: &str) -> String {
        if !self.objects.contains_key(requested) {
            return requested.to_string();
        }
        let base = match requested.rsplit_once('.') {
            Some((base, suffix))
                if suffix.len() == 3 && suffix.bytes().all(|b| b.is_ascii_digit()) =>
            {
                base
            }
            _ => requested,
        };
        (1..)
            .map(|n| format!("{base}.{n:03}"))
            .find(|candidate| !self.objects.contains_key(candidate))
            .unwrap_or_else(|| requested.to_string())
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl HostOperations for SceneHost {
    fn scene_info(&self) -> SceneInfo {
        SceneInfo {
            name: self.name.clone(),
            object_count: self.objects.len(),
            objects: self
                .objects
                .iter()
                .take(SUMMARY_LIMIT)
                .map(|(name, obj)| ObjectSummary {
                    name: name.clone(),
                    kind: obj.kind,
                    location: obj.transform.location.map(round2),
                })
                .collect(),
            materials_count: self.materials.len(),
            active_camera: self.active_camera.clone(),
        }
    }

    fn create_object(&mut self, spec: ObjectSpec) -> Result<ObjectInfo, HostError> {
        if self.objects.len() >= self.max_objects {
            return Err(HostError::LimitReached(format!(
                "scene already holds {} objects",
                self.max_objects
            )));
        }
        let requested = match spec.name {
            Some(name) => {
                if !self.name_pattern.is_match(&name) {
                    return Err(HostError::InvalidName(name));
                }
                name
            }
            None => spec.kind.default_name().to_string(),
        };
        let name = self.unique_name(&requested);

        let mut transform = spec.transform;
        if spec.kind == ObjectKind::Camera {
            // Cameras ignore scale on creation.
            transform.scale = Transform::default().scale;
        }
        let object = SceneObject {
            kind: spec.kind,
            transform,
            visible: true,
            materials: Vec::new(),
            mesh: spec.kind.primitive_mesh(),
            light: (spec.kind == ObjectKind::Light).then(|| spec.light.unwrap_or_default()),
            text: (spec.kind == ObjectKind::Text)
                .then(|| spec.text.unwrap_or_else(|| "Text".to_string())),
            curves: BTreeMap::new(),
        };
        self.objects.insert(name.clone(), object);
        if spec.kind == ObjectKind::Camera && self.active_camera.is_none() {
            self.active_camera = Some(name.clone());
        }
        debug!(object = %name, kind = ?spec.kind, "created object");
        self.info(&name)
    }

    fn modify_object(
        &mut self,
        name: &str,
        change: &TransformChange,
    ) -> Result<ObjectInfo, HostError> {
        let obj = self.object_mut(name)?;
        if let Some(location) = change.location {
            obj.transform.location = location;
        }
        if let Some(rotation) = change.rotation {
            obj.transform.rotation = rotation;
        }
        if let Some(scale) = change.scale {
            obj.transform.scale = scale;
        }
        if let Some(visible) = change.visible {
            obj.visible = visible;
        }
        self.info(name)
    }

    fn delete_object(&mut self, name: &str) -> Result<String, HostError> {
        self.objects
            .shift_remove(name)
            .ok_or_else(|| HostError::ObjectNotFound(name.to_string()))?;
        if self.active_camera.as_deref() == Some(name) {
            self.active_camera = None;
        }
        debug!(object = %name, "deleted object");
        Ok(name.to_string())
    }

    fn object_info(&self, name: &str) -> Result<ObjectInfo, HostError> {
        self.info(name)
    }

    fn set_material(
        &mut self,
        object: &str,
        material: Option<&str>,
        color: Option<Color>,
    ) -> Result<MaterialAssignment, HostError> {
        let kind = self.object(object)?.kind;
        if !kind.accepts_materials() {
            return Err(HostError::WrongKind {
                name: object.to_string(),
                expected: "mesh or text object",
            });
        }
        let material_name = material.map_or_else(|| format!("{object}_material"), str::to_string);

        let created = !self.materials.contains_key(&material_name);
        let entry = self
            .materials
            .entry(material_name.clone())
            .or_insert(Material { color: None });
        if color.is_some() {
            entry.color = color;
        }
        let color = entry.color;

        let obj = self.object_mut(object)?;
        match obj.materials.first_mut() {
            Some(slot) => slot.clone_from(&material_name),
            None => obj.materials.push(material_name.clone()),
        }

        Ok(MaterialAssignment {
            object: object.to_string(),
            material: material_name,
            color,
            created,
        })
    }

    fn set_active_camera(&mut self, name: &str) -> Result<ObjectInfo, HostError> {
        if self.object(name)?.kind != ObjectKind::Camera {
            return Err(HostError::WrongKind {
                name: name.to_string(),
                expected: "camera",
            });
        }
        self.active_camera = Some(name.to_string());
        self.info(name)
    }

    fn insert_keyframes(
        &mut self,
        object: &str,
        property: AnimatedProperty,
        keyframes: &[Keyframe],
    ) -> Result<KeyframeReport, HostError> {
        if keyframes.is_empty() {
            return Err(HostError::Failed("no keyframes given".to_string()));
        }
        let obj = self.object_mut(object)?;

        let mut curve: Vec<Keyframe> = keyframes
            .iter()
            .map(|k| match property {
                AnimatedProperty::RotationEuler => Keyframe {
                    frame: k.frame,
                    value: k.value.map(f64::to_radians),
                },
                AnimatedProperty::Location | AnimatedProperty::Scale => *k,
            })
            .collect();
        curve.sort_by_key(|k| k.frame);
        curve.dedup_by_key(|k| k.frame);

        // The property holds the value at the latest frame.
        if let Some(last) = curve.last() {
            let slot = match property {
                AnimatedProperty::Location => &mut obj.transform.location,
                AnimatedProperty::RotationEuler => &mut obj.transform.rotation,
                AnimatedProperty::Scale => &mut obj.transform.scale,
            };
            *slot = last.value;
        }

        let count = curve.len();
        obj.curves.insert(property, curve);
        Ok(KeyframeReport {
            object: object.to_string(),
            property,
            keyframes: count,
        })
    }

    fn join_objects(
        &mut self,
        objects: &[String],
        target: Option<&str>,
    ) -> Result<JoinReport, HostError> {
        let Some(first) = objects.first() else {
            return Err(HostError::Failed("no objects to join".to_string()));
        };
        for name in objects {
            if !self.object(name)?.kind.is_mesh() {
                return Err(HostError::WrongKind {
                    name: name.clone(),
                    expected: "mesh",
                });
            }
        }
        let target = match target {
            Some(t) if objects.iter().any(|o| o == t) => t.to_string(),
            Some(t) => {
                return Err(HostError::Failed(format!(
                    "join target '{t}' is not among the joined objects"
                )))
            }
            None => first.clone(),
        };

        let mut merged = MeshStats::default();
        let mut joined = 0;
        for name in objects {
            if *name == target {
                continue;
            }
            if let Some(obj) = self.objects.shift_remove(name) {
                if let Some(mesh) = obj.mesh {
                    merged.vertices += mesh.vertices;
                    merged.edges += mesh.edges;
                    merged.polygons += mesh.polygons;
                }
                joined += 1;
            }
        }

        let obj = self.object_mut(&target)?;
        let mesh = obj.mesh.get_or_insert_with(MeshStats::default);
        mesh.vertices += merged.vertices;
        mesh.edges += merged.edges;
        mesh.polygons += merged.polygons;
        let mesh = *mesh;

        debug!(target = %target, joined, "joined objects");
        Ok(JoinReport {
            target_object: target,
            joined_objects: joined,
            mesh,
        })
    }

    fn render(&mut self, settings: &RenderSettings) -> Result<RenderInfo, HostError> {
        let camera = self
            .active_camera
            .clone()
            .ok_or_else(|| HostError::Failed("no camera found in scene".to_string()))?;
        if let Some(x) = settings.resolution_x {
            self.resolution[0] = x;
        }
        if let Some(y) = settings.resolution_y {
            self.resolution[1] = y;
        }
        Ok(RenderInfo {
            rendered: true,
            output_path: settings
                .output_path
                .clone()
                .unwrap_or_else(|| "[not saved]".to_string()),
            resolution: self.resolution,
            camera,
        })
    }
}
