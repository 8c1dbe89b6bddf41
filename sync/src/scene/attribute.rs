//! Typed attribute slots and their wire representation.

use glam::{Quat, Vec2, Vec3, Vec4};

use undine_serde::{BitReader, BitWrite, Serde, SerdeResult};

use crate::{error::SceneError, math::Transform, types::EntityId};

/// Stable wire ids of the supported attribute value kinds. Every encoded
/// attribute occupies at least 8 bits, which the forward-compatibility
/// truncation rules rely on.
pub mod attr_type {
    pub const STRING: u8 = 1;
    pub const INT: u8 = 2;
    pub const REAL: u8 = 3;
    pub const COLOR: u8 = 4;
    pub const FLOAT2: u8 = 5;
    pub const FLOAT3: u8 = 6;
    pub const FLOAT4: u8 = 7;
    pub const BOOL: u8 = 8;
    pub const UINT: u8 = 9;
    pub const QUAT: u8 = 10;
    pub const DOUBLE: u8 = 11;
    pub const ENTITY_REF: u8 = 12;
    pub const BYTE_BUFFER: u8 = 13;
    pub const TRANSFORM: u8 = 14;
}

/// A tagged attribute value. Serialization dispatches on the tag.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i32),
    Real(f32),
    Color(Vec4),
    Float2(Vec2),
    Float3(Vec3),
    Float4(Vec4),
    Bool(bool),
    UInt(u32),
    Quat(Quat),
    Double(f64),
    EntityRef(EntityId),
    ByteBuffer(Vec<u8>),
    Transform(Transform),
}

impl AttributeValue {
    pub fn type_id(&self) -> u8 {
        match self {
            AttributeValue::String(_) => attr_type::STRING,
            AttributeValue::Int(_) => attr_type::INT,
            AttributeValue::Real(_) => attr_type::REAL,
            AttributeValue::Color(_) => attr_type::COLOR,
            AttributeValue::Float2(_) => attr_type::FLOAT2,
            AttributeValue::Float3(_) => attr_type::FLOAT3,
            AttributeValue::Float4(_) => attr_type::FLOAT4,
            AttributeValue::Bool(_) => attr_type::BOOL,
            AttributeValue::UInt(_) => attr_type::UINT,
            AttributeValue::Quat(_) => attr_type::QUAT,
            AttributeValue::Double(_) => attr_type::DOUBLE,
            AttributeValue::EntityRef(_) => attr_type::ENTITY_REF,
            AttributeValue::ByteBuffer(_) => attr_type::BYTE_BUFFER,
            AttributeValue::Transform(_) => attr_type::TRANSFORM,
        }
    }

    /// Zero value for a wire type id; `Err` for unknown ids.
    pub fn default_for(type_id: u8) -> Result<AttributeValue, SceneError> {
        Ok(match type_id {
            attr_type::STRING => AttributeValue::String(String::new()),
            attr_type::INT => AttributeValue::Int(0),
            attr_type::REAL => AttributeValue::Real(0.0),
            attr_type::COLOR => AttributeValue::Color(Vec4::ZERO),
            attr_type::FLOAT2 => AttributeValue::Float2(Vec2::ZERO),
            attr_type::FLOAT3 => AttributeValue::Float3(Vec3::ZERO),
            attr_type::FLOAT4 => AttributeValue::Float4(Vec4::ZERO),
            attr_type::BOOL => AttributeValue::Bool(false),
            attr_type::UINT => AttributeValue::UInt(0),
            attr_type::QUAT => AttributeValue::Quat(Quat::IDENTITY),
            attr_type::DOUBLE => AttributeValue::Double(0.0),
            attr_type::ENTITY_REF => AttributeValue::EntityRef(0),
            attr_type::BYTE_BUFFER => AttributeValue::ByteBuffer(Vec::new()),
            attr_type::TRANSFORM => AttributeValue::Transform(Transform::default()),
            other => return Err(SceneError::UnknownAttributeType(other)),
        })
    }

    pub fn to_binary(&self, writer: &mut dyn BitWrite) {
        match self {
            AttributeValue::String(v) => writer.write_string(v),
            AttributeValue::Int(v) => v.ser(writer),
            AttributeValue::Real(v) => v.ser(writer),
            AttributeValue::Color(v) | AttributeValue::Float4(v) => {
                for c in v.to_array() {
                    c.ser(writer);
                }
            }
            AttributeValue::Float2(v) => {
                for c in v.to_array() {
                    c.ser(writer);
                }
            }
            AttributeValue::Float3(v) => {
                for c in v.to_array() {
                    c.ser(writer);
                }
            }
            AttributeValue::Bool(v) => writer.write_byte(u8::from(*v)),
            AttributeValue::UInt(v) => v.ser(writer),
            AttributeValue::Quat(v) => {
                for c in v.to_array() {
                    c.ser(writer);
                }
            }
            AttributeValue::Double(v) => v.ser(writer),
            AttributeValue::EntityRef(v) => writer.write_vle_u32(*v),
            AttributeValue::ByteBuffer(v) => {
                writer.write_vle_u32(v.len() as u32);
                writer.write_bytes(v);
            }
            AttributeValue::Transform(v) => {
                for c in [v.pos, v.rot, v.scale] {
                    for f in c.to_array() {
                        f.ser(writer);
                    }
                }
            }
        }
    }

    pub fn from_binary(type_id: u8, reader: &mut BitReader) -> SerdeResult<AttributeValue> {
        fn vec3(reader: &mut BitReader) -> SerdeResult<Vec3> {
            Ok(Vec3::new(f32::de(reader)?, f32::de(reader)?, f32::de(reader)?))
        }
        fn vec4(reader: &mut BitReader) -> SerdeResult<Vec4> {
            Ok(Vec4::new(
                f32::de(reader)?,
                f32::de(reader)?,
                f32::de(reader)?,
                f32::de(reader)?,
            ))
        }

        Ok(match type_id {
            attr_type::STRING => AttributeValue::String(reader.read_string()?),
            attr_type::INT => AttributeValue::Int(i32::de(reader)?),
            attr_type::REAL => AttributeValue::Real(f32::de(reader)?),
            attr_type::COLOR => AttributeValue::Color(vec4(reader)?),
            attr_type::FLOAT2 => {
                AttributeValue::Float2(Vec2::new(f32::de(reader)?, f32::de(reader)?))
            }
            attr_type::FLOAT3 => AttributeValue::Float3(vec3(reader)?),
            attr_type::FLOAT4 => AttributeValue::Float4(vec4(reader)?),
            attr_type::BOOL => AttributeValue::Bool(reader.read_byte()? != 0),
            attr_type::UINT => AttributeValue::UInt(u32::de(reader)?),
            attr_type::QUAT => AttributeValue::Quat(Quat::from_vec4(vec4(reader)?)),
            attr_type::DOUBLE => AttributeValue::Double(f64::de(reader)?),
            attr_type::ENTITY_REF => AttributeValue::EntityRef(reader.read_vle_u32()?),
            attr_type::BYTE_BUFFER => {
                let len = reader.read_vle_u32()? as usize;
                AttributeValue::ByteBuffer(reader.read_bytes(len)?)
            }
            attr_type::TRANSFORM => {
                let pos = vec3(reader)?;
                let rot = vec3(reader)?;
                let scale = vec3(reader)?;
                AttributeValue::Transform(Transform { pos, rot, scale })
            }
            _ => {
                return Err(undine_serde::SerdeErr::InvalidValue {
                    context: "attribute type id",
                })
            }
        })
    }

    /// Interpolates toward `end` for the numeric kinds; non-numeric kinds
    /// snap to `end` once `t` reaches 1.
    pub fn lerp(&self, end: &AttributeValue, t: f32) -> AttributeValue {
        let t = t.clamp(0.0, 1.0);
        match (self, end) {
            (AttributeValue::Int(a), AttributeValue::Int(b)) => {
                AttributeValue::Int(a + ((*b - *a) as f32 * t).round() as i32)
            }
            (AttributeValue::Real(a), AttributeValue::Real(b)) => {
                AttributeValue::Real(a + (b - a) * t)
            }
            (AttributeValue::Double(a), AttributeValue::Double(b)) => {
                AttributeValue::Double(a + (b - a) * f64::from(t))
            }
            (AttributeValue::Float2(a), AttributeValue::Float2(b)) => {
                AttributeValue::Float2(a.lerp(*b, t))
            }
            (AttributeValue::Float3(a), AttributeValue::Float3(b)) => {
                AttributeValue::Float3(a.lerp(*b, t))
            }
            (AttributeValue::Float4(a), AttributeValue::Float4(b)) => {
                AttributeValue::Float4(a.lerp(*b, t))
            }
            (AttributeValue::Color(a), AttributeValue::Color(b)) => {
                AttributeValue::Color(a.lerp(*b, t))
            }
            (AttributeValue::Quat(a), AttributeValue::Quat(b)) => {
                AttributeValue::Quat(a.slerp(*b, t))
            }
            (AttributeValue::Transform(a), AttributeValue::Transform(b)) => {
                let mut out = Transform {
                    pos: a.pos.lerp(b.pos, t),
                    rot: Vec3::ZERO,
                    scale: a.scale.lerp(b.scale, t),
                };
                out.set_orientation(a.orientation().slerp(b.orientation(), t));
                AttributeValue::Transform(out)
            }
            _ => {
                if t >= 1.0 {
                    end.clone()
                } else {
                    self.clone()
                }
            }
        }
    }
}

/// Per-attribute metadata. The `interpolate` flag requests cubic-interpolated
/// application of incoming numeric updates on clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttributeMetadata {
    pub interpolate: bool,
}

/// A typed, named value slot on a component, addressed by a stable index.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
    pub metadata: AttributeMetadata,
    /// True for attributes added at runtime to a dynamic-capable component,
    /// as opposed to the static prefix defined by the component type.
    pub dynamic: bool,
}

impl Attribute {
    pub fn new_static(name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            name: name.into(),
            value,
            metadata: AttributeMetadata::default(),
            dynamic: false,
        }
    }

    pub fn new_dynamic(name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            name: name.into(),
            value,
            metadata: AttributeMetadata::default(),
            dynamic: true,
        }
    }

    pub fn type_id(&self) -> u8 {
        self.value.type_id()
    }
}
