//! Generic schema-driven decoding: walks an embedded [`TypeTree`] against an
//! object's bytes and produces a structural dump with no compiled-type
//! knowledge. Hand-written per-class decoders specialize this walk for speed
//! and typed results; the generic walker stays the only decoder usable for
//! unknown or partially recognized object kinds.

use serde::Serialize;
use tracing::{instrument, warn};

use crate::{ByteCursor, CrossRef, Error, ObjectReader, Result, TypeTree};

/// One named, typed slot in a structural dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: Value,
}

/// A decoded value tree: scalars, strings, raw bytes, arrays, nested
/// objects, or an unresolved object reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Ref(CrossRef),
    Array(Vec<Value>),
    Object(Vec<Field>),
}

impl Value {
    /// Direct child field of an object value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.iter().find(|f| f.name == name).map(|f| &f.value),
            _ => None,
        }
    }

    /// Depth-first search for a string field with the given name.
    pub fn find_string(&self, name: &str) -> Option<&str> {
        match self {
            Value::Object(fields) => fields.iter().find_map(|f| {
                if f.name == name {
                    match &f.value {
                        Value::String(s) => Some(s.as_str()),
                        _ => None,
                    }
                } else {
                    f.value.find_string(name)
                }
            }),
            Value::Array(items) => items.iter().find_map(|v| v.find_string(name)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::UInt8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Ref(r) => write!(f, "ref(file {}, id {})", r.file_index, r.path_id),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Object(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Decodes one object through its embedded schema.
///
/// Fails with [`Error::InvalidData`] when the object has no embedded type
/// tree; such objects stay available as raw bytes only.
#[instrument(name = "dump_object", skip_all, fields(path_id = reader.path_id()))]
pub fn dump_object(reader: &mut ObjectReader<'_>) -> Result<Value> {
    let tree = reader
        .type_tree()
        .ok_or_else(|| Error::InvalidData("object has no embedded type tree".into()))?;
    let big_ids = reader.file().big_ids();
    let expected = reader.object_len();
    let value = dump_tree(tree, reader, big_ids)?;
    let consumed = reader.position_in_object();
    if consumed != expected {
        warn!(
            consumed,
            expected, "object not fully consumed; schema may not match payload"
        );
    }
    Ok(value)
}

/// Walks a flattened node list against a cursor. The cursor must already be
/// positioned at the object's first byte.
pub(crate) fn dump_tree(tree: &TypeTree, cur: &mut ByteCursor, big_ids: bool) -> Result<Value> {
    if tree.nodes.is_empty() {
        return Err(Error::InvalidData("empty type tree".into()));
    }
    let walker = Walker { tree, big_ids };
    let (value, _) = walker.decode(cur, 0)?;
    Ok(value)
}

struct Walker<'t> {
    tree: &'t TypeTree,
    big_ids: bool,
}

impl Walker<'_> {
    /// Decodes the subtree rooted at node `i`; returns the value and the
    /// index of the first node after the subtree.
    fn decode(&self, cur: &mut ByteCursor, i: usize) -> Result<(Value, usize)> {
        let node = &self.tree.nodes[i];
        let end = self.tree.subtree_end(i);

        let value = if node.is_array {
            self.decode_array(cur, i)?
        } else {
            // every primitive read is followed by padding to the next
            // 4-byte boundary from stream start
            macro_rules! scalar {
                ($variant:ident, $read:ident) => {{
                    let v = cur.$read()?;
                    cur.align();
                    Value::$variant(v)
                }};
            }
            match node.type_name.as_str() {
                "bool" => scalar!(Bool, read_bool),
                "SInt8" => scalar!(Int8, read_i8),
                "UInt8" | "char" => scalar!(UInt8, read_u8),
                "SInt16" | "short" => scalar!(Int16, read_i16),
                "UInt16" | "unsigned short" => scalar!(UInt16, read_u16),
                "SInt32" | "int" | "Type*" => scalar!(Int32, read_i32),
                "UInt32" | "unsigned int" => scalar!(UInt32, read_u32),
                "SInt64" | "long long" => scalar!(Int64, read_i64),
                "UInt64" | "unsigned long long" | "FileSize" => scalar!(UInt64, read_u64),
                "float" => scalar!(Float, read_f32),
                "double" => scalar!(Double, read_f64),
                "string" => Value::String(cur.read_aligned_string()?),
                "TypelessData" => {
                    let len = cur.read_u32()? as usize;
                    let bytes = cur.read_bytes(len)?.to_vec();
                    cur.align();
                    Value::Bytes(bytes)
                }
                name if name.starts_with("PPtr<") => {
                    let file_index = cur.read_i32()?;
                    let path_id = if self.big_ids {
                        cur.read_i64()?
                    } else {
                        cur.read_i32()? as i64
                    };
                    Value::Ref(CrossRef {
                        file_index,
                        path_id,
                    })
                }
                _ => {
                    // container types (vector, map, staticvector) wrap a
                    // single array-flagged child
                    let children = self.tree.children_of(i);
                    match children.first() {
                        Some(&c0) if self.tree.nodes[c0].is_array => self.decode_array(cur, c0)?,
                        _ => {
                            let mut fields = Vec::with_capacity(children.len());
                            for &c in &children {
                                let (value, _) = self.decode(cur, c)?;
                                let child = &self.tree.nodes[c];
                                fields.push(Field {
                                    name: child.name.clone(),
                                    type_name: child.type_name.clone(),
                                    value,
                                });
                            }
                            Value::Object(fields)
                        }
                    }
                }
            }
        };
        if node.requires_align() {
            cur.align();
        }
        Ok((value, end))
    }

    /// Array-flagged node: its subtree holds the size node and, once, the
    /// element subtree, replayed here per runtime element count. The count
    /// is data, not schema.
    fn decode_array(&self, cur: &mut ByteCursor, i: usize) -> Result<Value> {
        let children = self.tree.children_of(i);
        let [_size, elem] = children.as_slice() else {
            return Err(Error::InvalidData(format!(
                "array node {:?} has {} children, expected size and element",
                self.tree.nodes[i].name,
                children.len()
            )));
        };
        let count = cur.read_i32()?;
        if count < 0 || count as usize > cur.remaining() {
            return Err(Error::Structural(format!(
                "array count {count} exceeds remaining stream"
            )));
        }
        let elem_node = &self.tree.nodes[*elem];
        // byte arrays are packed, not per-element aligned
        if matches!(elem_node.type_name.as_str(), "UInt8" | "char") {
            let bytes = cur.read_bytes(count as usize)?.to_vec();
            cur.align();
            return Ok(Value::Bytes(bytes));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (value, _) = self.decode(cur, *elem)?;
            items.push(value);
        }
        Ok(Value::Array(items))
    }
}
