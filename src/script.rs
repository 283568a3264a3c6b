//! Metadata-driven decoding for user-script object instances.
//!
//! A script object's embedded schema names its script reference and a few
//! built-in bytes; the real field layout exists only in the compiled script
//! assembly. This module consumes a flat, ordered field-descriptor view of
//! that metadata (base-type fields prepended in declaration order) and
//! replays the producer's field-serialization-eligibility rules against the
//! object's bytes. It deliberately depends on no particular
//! metadata-reading ecosystem; the loader collaborator supplies the
//! descriptors.

use tracing::{instrument, warn};

use crate::dump::{Field, Value};
use crate::{CrossRef, Error, ObjectReader, Result, UnityVersion};

/// Lookup into loaded compiled-type metadata, keyed by assembly name and
/// qualified type name.
pub trait ScriptTypeRegistry {
    fn get(&self, assembly: &str, full_name: &str) -> Option<&ScriptType>;
}

/// The compiled field list of one script class. `fields` contains base-type
/// fields first, each level in declaration order, matching the producer's
/// serialization order exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptType {
    pub assembly: String,
    pub full_name: String,
    pub fields: Vec<ScriptField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptField {
    pub name: String,
    pub field_type: ScriptFieldType,
    pub is_public: bool,
    pub is_static: bool,
    pub is_init_only: bool,
    /// Non-public fields opted in by the recognized marker attribute.
    pub has_serialize_marker: bool,
    pub has_non_serialized_marker: bool,
}

impl ScriptField {
    /// The producer's eligibility rule: a field participates in the archive
    /// iff it is a public instance field that is neither static nor
    /// read-only, or a non-public instance field carrying the marker
    /// attribute.
    pub fn is_serialized(&self) -> bool {
        if self.is_static || self.is_init_only || self.has_non_serialized_marker {
            return false;
        }
        self.is_public || self.has_serialize_marker
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
}

/// Engine-defined value types whose byte layout is hard-coded and
/// version-gated; they never carry their own embedded schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineValue {
    Vector2,
    Vector3,
    Vector4,
    Quaternion,
    Color,
    Color32,
    Rect,
    Matrix4x4,
    LayerMask,
    RectOffset,
    AnimationCurve,
    Gradient,
    /// Recognized but not yet decodable; hitting one aborts the field walk.
    Font,
    /// Recognized but not yet decodable; hitting one aborts the field walk.
    GuiStyle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptFieldType {
    Primitive(Primitive),
    /// Enums serialize as their 32-bit underlying value.
    Enum,
    Str,
    Array(Box<ScriptFieldType>),
    /// The single-generic-argument list container.
    List(Box<ScriptFieldType>),
    /// A reference type assignable to the base engine object type; stored
    /// as an indirect reference, never inline.
    EngineObject(String),
    EngineValue(EngineValue),
    /// A user-defined serializable class, resolved through the registry and
    /// decoded inline.
    Nested(String),
    /// Anything the producer would not have serialized, or that this
    /// decoder cannot size. Encountering one is a hard stop.
    Unsupported(String),
}

/// Result of a metadata-driven walk. `complete` is false when the walk hit
/// a field it could not decode safely; the value then holds every field up
/// to the stop, and sibling objects are unaffected.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptDump {
    pub value: Value,
    pub complete: bool,
}

/// The built-in prefix every script instance carries before its own fields.
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviourHeader {
    pub game_object: CrossRef,
    pub enabled: bool,
    pub script: CrossRef,
    pub name: String,
}

/// Reads the built-in prefix of a script instance, leaving the cursor at
/// the first script-defined field. The script reference identifies which
/// compiled type to look up.
#[instrument(name = "BehaviourHeader_read", skip_all)]
pub fn read_behaviour_header(reader: &mut ObjectReader<'_>) -> Result<BehaviourHeader> {
    let game_object = reader.read_cross_ref()?;
    let enabled = reader.read_bool()?;
    reader.align();
    let script = reader.read_cross_ref()?;
    let name = reader.read_aligned_string()?;
    Ok(BehaviourHeader {
        game_object,
        enabled,
        script,
        name,
    })
}

/// Decodes the script-defined fields of one object through compiled
/// metadata. The cursor must already be past the built-in prefix (see
/// [`read_behaviour_header`]).
///
/// An unsupported field stops the walk for this object only and flags the
/// result as truncated; decoding past a field of unknown width would
/// desynchronize every subsequent field irrecoverably.
#[instrument(name = "dump_script_object", skip_all, fields(type_name = full_name))]
pub fn dump_script_object(
    reader: &mut ObjectReader<'_>,
    assembly: &str,
    full_name: &str,
    registry: &dyn ScriptTypeRegistry,
) -> Result<ScriptDump> {
    let ty = registry.get(assembly, full_name).ok_or_else(|| {
        Error::InvalidData(format!("no compiled metadata for {assembly}/{full_name}"))
    })?;
    let walker = ScriptWalker {
        registry,
        assembly,
        engine: reader.file().unity_version(),
    };
    let mut fields = Vec::new();
    for field in ty.fields.iter().filter(|f| f.is_serialized()) {
        match walker.decode_field(reader, &field.field_type, 0) {
            Ok(value) => fields.push(Field {
                name: field.name.clone(),
                type_name: type_label(&field.field_type),
                value,
            }),
            Err(Error::UnsupportedField { name, type_name }) => {
                warn!(
                    field = %field.name,
                    stopped_at = %name,
                    %type_name,
                    "unsupported field type, truncating object walk"
                );
                return Ok(ScriptDump {
                    value: Value::Object(fields),
                    complete: false,
                });
            }
            Err(err) => return Err(err),
        }
    }
    Ok(ScriptDump {
        value: Value::Object(fields),
        complete: true,
    })
}

/// Recursion bound for pathological metadata; the compiled type structure,
/// not runtime data, bounds legitimate nesting.
const MAX_NESTING: usize = 64;

struct ScriptWalker<'a> {
    registry: &'a dyn ScriptTypeRegistry,
    assembly: &'a str,
    engine: UnityVersion,
}

impl ScriptWalker<'_> {
    fn decode_field(
        &self,
        reader: &mut ObjectReader<'_>,
        ty: &ScriptFieldType,
        depth: usize,
    ) -> Result<Value> {
        if depth > MAX_NESTING {
            return Err(Error::UnsupportedField {
                name: "<nested>".into(),
                type_name: type_label(ty),
            });
        }
        match ty {
            ScriptFieldType::Primitive(p) => self.decode_primitive(reader, *p),
            ScriptFieldType::Enum => {
                let v = reader.read_u32()?;
                reader.align();
                Ok(Value::UInt32(v))
            }
            ScriptFieldType::Str => Ok(Value::String(reader.read_aligned_string()?)),
            ScriptFieldType::Array(elem) | ScriptFieldType::List(elem) => {
                self.decode_sequence(reader, elem, depth)
            }
            ScriptFieldType::EngineObject(_) => Ok(Value::Ref(reader.read_cross_ref()?)),
            ScriptFieldType::EngineValue(v) => self.decode_engine_value(reader, *v),
            ScriptFieldType::Nested(full_name) => {
                let nested = self.registry.get(self.assembly, full_name).ok_or_else(|| {
                    Error::UnsupportedField {
                        name: full_name.clone(),
                        type_name: "<unregistered class>".into(),
                    }
                })?;
                let mut fields = Vec::new();
                for field in nested.fields.iter().filter(|f| f.is_serialized()) {
                    let value = self.decode_field(reader, &field.field_type, depth + 1)?;
                    fields.push(Field {
                        name: field.name.clone(),
                        type_name: type_label(&field.field_type),
                        value,
                    });
                }
                Ok(Value::Object(fields))
            }
            ScriptFieldType::Unsupported(name) => Err(Error::UnsupportedField {
                name: name.clone(),
                type_name: "<unsupported>".into(),
            }),
        }
    }

    fn decode_primitive(&self, reader: &mut ObjectReader<'_>, p: Primitive) -> Result<Value> {
        let value = match p {
            Primitive::Bool => Value::Bool(reader.read_bool()?),
            Primitive::Int8 => Value::Int8(reader.read_i8()?),
            Primitive::UInt8 => Value::UInt8(reader.read_u8()?),
            Primitive::Int16 => Value::Int16(reader.read_i16()?),
            Primitive::UInt16 => Value::UInt16(reader.read_u16()?),
            Primitive::Int32 => Value::Int32(reader.read_i32()?),
            Primitive::UInt32 => Value::UInt32(reader.read_u32()?),
            Primitive::Int64 => Value::Int64(reader.read_i64()?),
            Primitive::UInt64 => Value::UInt64(reader.read_u64()?),
            Primitive::Float => Value::Float(reader.read_f32()?),
            Primitive::Double => Value::Double(reader.read_f64()?),
        };
        reader.align();
        Ok(value)
    }

    /// Arrays and lists share a layout: element count, then that many
    /// element values. Only element types the producer itself would have
    /// serialized are decodable; anything else is a hard stop, because a
    /// wrong element width corrupts every later field.
    fn decode_sequence(
        &self,
        reader: &mut ObjectReader<'_>,
        elem: &ScriptFieldType,
        depth: usize,
    ) -> Result<Value> {
        if !self.element_eligible(elem) {
            return Err(Error::UnsupportedField {
                name: "<element>".into(),
                type_name: type_label(elem),
            });
        }
        let count = reader.read_i32()?;
        if count < 0 || count as usize > reader.remaining() {
            return Err(Error::Structural(format!(
                "sequence count {count} exceeds remaining stream"
            )));
        }
        // byte sequences are packed, not per-element aligned
        if matches!(elem, ScriptFieldType::Primitive(Primitive::UInt8)) {
            let bytes = reader.read_bytes(count as usize)?.to_vec();
            reader.align();
            return Ok(Value::Bytes(bytes));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(self.decode_field(reader, elem, depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn element_eligible(&self, elem: &ScriptFieldType) -> bool {
        match elem {
            ScriptFieldType::Primitive(_)
            | ScriptFieldType::Enum
            | ScriptFieldType::Str
            | ScriptFieldType::EngineObject(_) => true,
            ScriptFieldType::EngineValue(v) => {
                !matches!(v, EngineValue::Font | EngineValue::GuiStyle)
            }
            ScriptFieldType::Nested(full_name) => {
                self.registry.get(self.assembly, full_name).is_some()
            }
            // nested sequences need another indirection layer in source
            ScriptFieldType::Array(_) | ScriptFieldType::List(_) => false,
            ScriptFieldType::Unsupported(_) => false,
        }
    }

    fn decode_engine_value(&self, reader: &mut ObjectReader<'_>, v: EngineValue) -> Result<Value> {
        let f32_field = |reader: &mut ObjectReader<'_>, name: &str| -> Result<Field> {
            let value = reader.read_f32()?;
            reader.align();
            Ok(Field {
                name: name.into(),
                type_name: "float".into(),
                value: Value::Float(value),
            })
        };
        match v {
            EngineValue::Vector2 => {
                let fields = vec![f32_field(reader, "x")?, f32_field(reader, "y")?];
                Ok(Value::Object(fields))
            }
            EngineValue::Vector3 => {
                let fields = vec![
                    f32_field(reader, "x")?,
                    f32_field(reader, "y")?,
                    f32_field(reader, "z")?,
                ];
                Ok(Value::Object(fields))
            }
            EngineValue::Vector4 | EngineValue::Quaternion => {
                let fields = vec![
                    f32_field(reader, "x")?,
                    f32_field(reader, "y")?,
                    f32_field(reader, "z")?,
                    f32_field(reader, "w")?,
                ];
                Ok(Value::Object(fields))
            }
            EngineValue::Color => {
                let fields = vec![
                    f32_field(reader, "r")?,
                    f32_field(reader, "g")?,
                    f32_field(reader, "b")?,
                    f32_field(reader, "a")?,
                ];
                Ok(Value::Object(fields))
            }
            EngineValue::Color32 => {
                let rgba = reader.read_u32()?;
                reader.align();
                Ok(Value::UInt32(rgba))
            }
            EngineValue::Rect => {
                let fields = vec![
                    f32_field(reader, "x")?,
                    f32_field(reader, "y")?,
                    f32_field(reader, "width")?,
                    f32_field(reader, "height")?,
                ];
                Ok(Value::Object(fields))
            }
            EngineValue::Matrix4x4 => {
                let mut items = Vec::with_capacity(16);
                for _ in 0..16 {
                    items.push(Value::Float(reader.read_f32()?));
                    reader.align();
                }
                Ok(Value::Array(items))
            }
            EngineValue::LayerMask => {
                let bits = reader.read_u32()?;
                reader.align();
                Ok(Value::UInt32(bits))
            }
            EngineValue::RectOffset => {
                let mut fields = Vec::with_capacity(4);
                for name in ["left", "right", "top", "bottom"] {
                    let value = reader.read_i32()?;
                    reader.align();
                    fields.push(Field {
                        name: name.into(),
                        type_name: "int".into(),
                        value: Value::Int32(value),
                    });
                }
                Ok(Value::Object(fields))
            }
            EngineValue::AnimationCurve => self.decode_animation_curve(reader),
            EngineValue::Gradient => self.decode_gradient(reader),
            EngineValue::Font | EngineValue::GuiStyle => Err(Error::UnsupportedField {
                name: "<engine value>".into(),
                type_name: if v == EngineValue::Font {
                    "Font".into()
                } else {
                    "GUIStyle".into()
                },
            }),
        }
    }

    /// Keyframes grew weighted-tangent fields in 2018.1; the curve itself
    /// grew a rotation-order tag in 5.3.
    fn decode_animation_curve(&self, reader: &mut ObjectReader<'_>) -> Result<Value> {
        let weighted = self.engine >= UnityVersion::new(2018, 1, 0);
        let count = reader.read_i32()?;
        if count < 0 || count as usize > reader.remaining() {
            return Err(Error::Structural(format!(
                "keyframe count {count} exceeds remaining stream"
            )));
        }
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut fields = Vec::new();
            for name in ["time", "value", "inSlope", "outSlope"] {
                fields.push(Field {
                    name: name.into(),
                    type_name: "float".into(),
                    value: Value::Float(reader.read_f32()?),
                });
                reader.align();
            }
            if weighted {
                let mode = reader.read_i32()?;
                reader.align();
                fields.push(Field {
                    name: "weightedMode".into(),
                    type_name: "int".into(),
                    value: Value::Int32(mode),
                });
                for name in ["inWeight", "outWeight"] {
                    fields.push(Field {
                        name: name.into(),
                        type_name: "float".into(),
                        value: Value::Float(reader.read_f32()?),
                    });
                    reader.align();
                }
            }
            keys.push(Value::Object(fields));
        }
        let mut fields = vec![Field {
            name: "m_Curve".into(),
            type_name: "vector".into(),
            value: Value::Array(keys),
        }];
        for name in ["m_PreInfinity", "m_PostInfinity"] {
            let value = reader.read_i32()?;
            reader.align();
            fields.push(Field {
                name: name.into(),
                type_name: "int".into(),
                value: Value::Int32(value),
            });
        }
        if self.engine >= UnityVersion::new(5, 3, 0) {
            let value = reader.read_i32()?;
            reader.align();
            fields.push(Field {
                name: "m_RotationOrder".into(),
                type_name: "int".into(),
                value: Value::Int32(value),
            });
        }
        Ok(Value::Object(fields))
    }

    /// Gradient keys widened from packed 32-bit colors to float colors in
    /// 5.5, which also added the blend-mode tag.
    fn decode_gradient(&self, reader: &mut ObjectReader<'_>) -> Result<Value> {
        let float_keys = self.engine >= UnityVersion::new(5, 5, 0);
        let mut fields = Vec::new();
        for i in 0..8 {
            let name = format!("key{i}");
            if float_keys {
                let mut color = Vec::with_capacity(4);
                for channel in ["r", "g", "b", "a"] {
                    let value = reader.read_f32()?;
                    reader.align();
                    color.push(Field {
                        name: channel.into(),
                        type_name: "float".into(),
                        value: Value::Float(value),
                    });
                }
                fields.push(Field {
                    name,
                    type_name: "ColorRGBA".into(),
                    value: Value::Object(color),
                });
            } else {
                let rgba = reader.read_u32()?;
                reader.align();
                fields.push(Field {
                    name,
                    type_name: "ColorRGBA".into(),
                    value: Value::UInt32(rgba),
                });
            }
        }
        for prefix in ["ctime", "atime"] {
            for i in 0..8 {
                let value = reader.read_u16()?;
                reader.align();
                fields.push(Field {
                    name: format!("{prefix}{i}"),
                    type_name: "UInt16".into(),
                    value: Value::UInt16(value),
                });
            }
        }
        if float_keys {
            let mode = reader.read_i32()?;
            reader.align();
            fields.push(Field {
                name: "m_Mode".into(),
                type_name: "int".into(),
                value: Value::Int32(mode),
            });
        }
        for name in ["m_NumColorKeys", "m_NumAlphaKeys"] {
            let value = reader.read_u8()?;
            fields.push(Field {
                name: name.into(),
                type_name: "UInt8".into(),
                value: Value::UInt8(value),
            });
        }
        reader.align();
        Ok(Value::Object(fields))
    }
}

fn type_label(ty: &ScriptFieldType) -> String {
    match ty {
        ScriptFieldType::Primitive(p) => match p {
            Primitive::Bool => "bool".into(),
            Primitive::Int8 => "SInt8".into(),
            Primitive::UInt8 => "UInt8".into(),
            Primitive::Int16 => "SInt16".into(),
            Primitive::UInt16 => "UInt16".into(),
            Primitive::Int32 => "int".into(),
            Primitive::UInt32 => "unsigned int".into(),
            Primitive::Int64 => "SInt64".into(),
            Primitive::UInt64 => "UInt64".into(),
            Primitive::Float => "float".into(),
            Primitive::Double => "double".into(),
        },
        ScriptFieldType::Enum => "int".into(),
        ScriptFieldType::Str => "string".into(),
        ScriptFieldType::Array(elem) | ScriptFieldType::List(elem) => {
            format!("vector<{}>", type_label(elem))
        }
        ScriptFieldType::EngineObject(name) => format!("PPtr<{name}>"),
        ScriptFieldType::EngineValue(v) => match v {
            EngineValue::Vector2 => "Vector2f".into(),
            EngineValue::Vector3 => "Vector3f".into(),
            EngineValue::Vector4 => "Vector4f".into(),
            EngineValue::Quaternion => "Quaternionf".into(),
            EngineValue::Color => "ColorRGBA".into(),
            EngineValue::Color32 => "ColorRGBA".into(),
            EngineValue::Rect => "Rectf".into(),
            EngineValue::Matrix4x4 => "Matrix4x4f".into(),
            EngineValue::LayerMask => "BitField".into(),
            EngineValue::RectOffset => "RectOffset".into(),
            EngineValue::AnimationCurve => "AnimationCurve".into(),
            EngineValue::Gradient => "Gradient".into(),
            EngineValue::Font => "Font".into(),
            EngineValue::GuiStyle => "GUIStyle".into(),
        },
        ScriptFieldType::Nested(name) => name.clone(),
        ScriptFieldType::Unsupported(name) => name.clone(),
    }
}
