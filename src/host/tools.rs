//! Scene tools exposed to clients.
//!
//! Each tool parses its parameters into a typed struct, calls one
//! [`HostOperations`](super::HostOperations) method through the
//! [`ToolContext`], and returns the serialised result.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    AnimatedProperty, Color, Keyframe, LightKind, ObjectKind, ObjectSpec, RenderSettings,
    Transform, TransformChange, Vec3,
};
use crate::error::ToolError;
use crate::registry::{ToolOutput, ToolParams, ToolRegistry};
use crate::scheduler::ToolContext;

fn parse<T: DeserializeOwned>(params: ToolParams) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(params)).map_err(|e| ToolError::InvalidParams(e.to_string()))
}

fn output<T: Serialize>(value: &T) -> Result<ToolOutput, ToolError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => {
            let mut map = ToolOutput::new();
            map.insert("value".to_string(), other);
            Ok(map)
        }
        Err(e) => Err(ToolError::Execution(format!("failed to serialise result: {e}"))),
    }
}

fn vec3_schema(description: &str) -> Value {
    json!({
        "type": "array",
        "items": { "type": "number" },
        "minItems": 3,
        "maxItems": 3,
        "description": description
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NameParams {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateParams {
    #[serde(rename = "type", default = "default_kind")]
    kind: ObjectKind,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location: Option<Vec3>,
    #[serde(default)]
    rotation: Option<Vec3>,
    #[serde(default)]
    scale: Option<Vec3>,
    #[serde(default)]
    light_type: Option<LightKind>,
    #[serde(default)]
    text: Option<String>,
}

const fn default_kind() -> ObjectKind {
    ObjectKind::Cube
}

#[derive(Debug, Deserialize)]
struct ModifyParams {
    name: String,
    #[serde(flatten)]
    change: TransformChange,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MaterialParams {
    object_name: String,
    #[serde(default)]
    material_name: Option<String>,
    #[serde(default)]
    color: Option<Vec<f64>>,
}

fn parse_color(components: &[f64]) -> Result<Color, ToolError> {
    match *components {
        [r, g, b] => Ok([r, g, b, 1.0]),
        [r, g, b, a] => Ok([r, g, b, a]),
        _ => Err(ToolError::InvalidParams(format!(
            "color needs 3 or 4 components, got {}",
            components.len()
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyframeList {
    /// `{"1": [x, y, z], "24": [x, y, z]}`
    ByFrame(BTreeMap<String, Vec3>),
    /// `[{"frame": 1, "value": [x, y, z]}, ...]`
    List(Vec<Keyframe>),
}

impl KeyframeList {
    fn into_keyframes(self) -> Result<Vec<Keyframe>, ToolError> {
        match self {
            Self::List(list) => Ok(list),
            Self::ByFrame(map) => map
                .into_iter()
                .map(|(frame, value)| {
                    frame
                        .trim()
                        .parse::<i32>()
                        .map(|frame| Keyframe { frame, value })
                        .map_err(|_| ToolError::InvalidParams(format!("invalid frame number '{frame}'")))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyframeParams {
    object_name: String,
    #[serde(default = "default_property")]
    property: AnimatedProperty,
    keyframes: KeyframeList,
}

const fn default_property() -> AnimatedProperty {
    AnimatedProperty::Location
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JoinParams {
    objects: Vec<String>,
    #[serde(default)]
    target_object: Option<String>,
}

fn echo(_: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    Ok(params)
}

fn scene_info(ctx: &mut ToolContext<'_>, _: ToolParams) -> Result<ToolOutput, ToolError> {
    output(&ctx.host()?.scene_info())
}

fn create_object(ctx: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    let p: CreateParams = parse(params)?;
    let defaults = Transform::default();
    let spec = ObjectSpec {
        kind: p.kind,
        name: p.name,
        transform: Transform {
            location: p.location.unwrap_or(defaults.location),
            rotation: p.rotation.unwrap_or(defaults.rotation),
            scale: p.scale.unwrap_or(defaults.scale),
        },
        light: p.light_type,
        text: p.text,
    };
    output(&ctx.host()?.create_object(spec)?)
}

fn modify_object(ctx: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    let p: ModifyParams = parse(params)?;
    output(&ctx.host()?.modify_object(&p.name, &p.change)?)
}

fn delete_object(ctx: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    let p: NameParams = parse(params)?;
    let deleted = ctx.host()?.delete_object(&p.name)?;
    output(&json!({ "deleted": deleted }))
}

fn object_info(ctx: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    let p: NameParams = parse(params)?;
    output(&ctx.host()?.object_info(&p.name)?)
}

fn set_material(ctx: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    let p: MaterialParams = parse(params)?;
    let color = p.color.as_deref().map(parse_color).transpose()?;
    output(&ctx
        .host()?
        .set_material(&p.object_name, p.material_name.as_deref(), color)?)
}

fn set_active_camera(ctx: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    let p: NameParams = parse(params)?;
    output(&ctx.host()?.set_active_camera(&p.name)?)
}

fn insert_keyframes(ctx: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    let p: KeyframeParams = parse(params)?;
    let keyframes = p.keyframes.into_keyframes()?;
    output(&ctx
        .host()?
        .insert_keyframes(&p.object_name, p.property, &keyframes)?)
}

fn join_objects(ctx: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    let p: JoinParams = parse(params)?;
    output(&ctx
        .host()?
        .join_objects(&p.objects, p.target_object.as_deref())?)
}

fn render_scene(ctx: &mut ToolContext<'_>, params: ToolParams) -> Result<ToolOutput, ToolError> {
    let settings: RenderSettings = parse(params)?;
    output(&ctx.host()?.render(&settings)?)
}

/// Registers the built-in scene tools.
#[allow(clippy::too_many_lines)]
pub fn register_scene_tools(registry: &ToolRegistry) {
    registry.register(
        "test.echo",
        "Return the given parameters unchanged. Does not touch the scene.",
        json!({ "type": "object" }),
        echo,
    );

    registry.register(
        "scene.get_info",
        "Summarise the scene: name, object count, the first objects and the active camera.",
        json!({ "type": "object", "properties": {} }),
        scene_info,
    );

    registry.register(
        "object.create",
        "Create an object. Names that are taken get a numeric suffix (Cube.001).",
        json!({
            "type": "object",
            "properties": {
                "type": {
                    "type": "string",
                    "enum": ["CUBE", "SPHERE", "CYLINDER", "PLANE", "CONE", "TORUS",
                             "EMPTY", "CAMERA", "LIGHT", "TEXT"],
                    "description": "Object kind (default CUBE)"
                },
                "name": { "type": "string", "description": "Requested object name" },
                "location": vec3_schema("World-space location"),
                "rotation": vec3_schema("Euler rotation in radians"),
                "scale": vec3_schema("Per-axis scale"),
                "light_type": {
                    "type": "string",
                    "enum": ["POINT", "SUN", "SPOT", "AREA"],
                    "description": "Light type when type is LIGHT"
                },
                "text": { "type": "string", "description": "Body when type is TEXT" }
            }
        }),
        create_object,
    );

    registry.register(
        "object.modify",
        "Change an object's location, rotation, scale or visibility.",
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "location": vec3_schema("New location"),
                "rotation": vec3_schema("New Euler rotation in radians"),
                "scale": vec3_schema("New scale"),
                "visible": { "type": "boolean" }
            },
            "required": ["name"]
        }),
        modify_object,
    );

    registry.register(
        "object.delete",
        "Delete an object.",
        json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        }),
        delete_object,
    );

    registry.register(
        "object.get_info",
        "Describe one object: transform, visibility, materials and geometry.",
        json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        }),
        object_info,
    );

    registry.register(
        "material.set",
        "Assign a material to an object's first slot, creating it if needed.",
        json!({
            "type": "object",
            "properties": {
                "object_name": { "type": "string" },
                "material_name": {
                    "type": "string",
                    "description": "Defaults to <object_name>_material"
                },
                "color": {
                    "type": "array",
                    "items": { "type": "number" },
                    "description": "RGB or RGBA base colour, components 0..1"
                }
            },
            "required": ["object_name"]
        }),
        set_material,
    );

    registry.register(
        "camera.set_active",
        "Make a camera object the scene camera.",
        json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        }),
        set_active_camera,
    );

    registry.register(
        "animation.insert_keyframes",
        "Replace the keyframes of an object's location, rotation_euler (degrees) or scale.",
        json!({
            "type": "object",
            "properties": {
                "object_name": { "type": "string" },
                "property": {
                    "type": "string",
                    "enum": ["location", "rotation_euler", "scale"]
                },
                "keyframes": {
                    "type": ["object", "array"],
                    "description": "Map of frame number to [x, y, z], or a list of {frame, value}"
                }
            },
            "required": ["object_name", "keyframes"]
        }),
        insert_keyframes,
    );

    registry.register(
        "object.join",
        "Merge mesh objects into one target object.",
        json!({
            "type": "object",
            "properties": {
                "objects": { "type": "array", "items": { "type": "string" } },
                "target_object": {
                    "type": "string",
                    "description": "Defaults to the first listed object"
                }
            },
            "required": ["objects"]
        }),
        join_objects,
    );

    registry.register(
        "render.scene",
        "Render the scene from the active camera.",
        json!({
            "type": "object",
            "properties": {
                "output_path": { "type": "string" },
                "resolution_x": { "type": "integer" },
                "resolution_y": { "type": "integer" }
            }
        }),
        render_scene,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_scene_tool() {
        let registry = ToolRegistry::new();
        register_scene_tools(&registry);
        let mut names: Vec<_> = registry.list().into_iter().map(|t| t.name).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "animation.insert_keyframes",
                "camera.set_active",
                "material.set",
                "object.create",
                "object.delete",
                "object.get_info",
                "object.join",
                "object.modify",
                "render.scene",
                "scene.get_info",
                "test.echo",
            ]
        );
    }

    #[test]
    fn keyframes_accept_both_shapes() {
        let by_frame: KeyframeList =
            serde_json::from_value(json!({"1": [0, 0, 0], "24": [1, 2, 3]})).unwrap();
        let frames = by_frame.into_keyframes().unwrap();
        assert_eq!(frames.len(), 2);

        let list: KeyframeList =
            serde_json::from_value(json!([{"frame": 5, "value": [1, 1, 1]}])).unwrap();
        assert_eq!(list.into_keyframes().unwrap()[0].frame, 5);
    }

    #[test]
    fn bad_frame_number_is_invalid_params() {
        let list: KeyframeList = serde_json::from_value(json!({"one": [0, 0, 0]})).unwrap();
        assert!(matches!(
            list.into_keyframes(),
            Err(ToolError::InvalidParams(_))
        ));
    }

    #[test]
    fn color_accepts_rgb_and_rgba() {
        assert_eq!(parse_color(&[0.1, 0.2, 0.3]).unwrap(), [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(parse_color(&[0.1, 0.2, 0.3, 0.5]).unwrap()[3], 0.5);
        assert!(parse_color(&[1.0]).is_err());
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let map = json!({"name": "Cube", "colour": "red"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(matches!(
            parse::<NameParams>(map),
            Err(ToolError::InvalidParams(_))
        ));
    }
}
