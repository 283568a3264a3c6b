use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::instrument;

use crate::{ByteCursor, Error, Result, UnityVersion};

bitflags::bitflags! {
    /// Transfer meta flags attached to each field node. Only the alignment
    /// bit affects decoding; the rest are editor hints carried through
    /// unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MetaFlags: u32 {
        const HIDE_IN_EDITOR = 0x1;
        const NOT_EDITABLE = 0x10;
        const STRONG_PPTR = 0x40;
        const TREAT_INTEGER_AS_BOOLEAN = 0x100;
        const DEBUG_PROPERTY = 0x1000;
        const ALIGN_BYTES = 0x4000;
        const ANY_CHILD_USES_ALIGN_BYTES = 0x8000;
        const IGNORE_IN_META_FILES = 0x80000;
        const TRANSFER_AS_ARRAY_ENTRY_NAME_IN_META_FILES = 0x100000;
        const TRANSFER_USING_FLOW_MAPPING_STYLE = 0x200000;
        const GENERATE_BITWISE_DIFFERENCES = 0x400000;
        const DONT_ANIMATE = 0x800000;
    }
}

/// One field descriptor in a flattened schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNode {
    pub type_name: String,
    pub name: String,
    pub byte_size: i32,
    pub index: i32,
    /// Nesting depth; the flattened list is a pre-order walk and depth
    /// strictly encodes the tree shape.
    pub depth: u8,
    pub is_array: bool,
    /// Per-node format tag written by the producer.
    pub version: i32,
    pub meta_flags: MetaFlags,
}

impl FieldNode {
    pub fn requires_align(&self) -> bool {
        self.meta_flags.contains(MetaFlags::ALIGN_BYTES)
    }
}

/// An embedded schema: the pre-order flattening of one object kind's field
/// tree. Immutable once parsed and shared read-only across all objects of
/// the same declared type within one container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeTree {
    pub nodes: Vec<FieldNode>,
}

impl TypeTree {
    /// Indices of the direct children of node `i`: the contiguous run of
    /// nodes at depth + 1 before the subtree ends.
    pub fn children_of(&self, i: usize) -> Vec<usize> {
        let depth = self.nodes[i].depth;
        let mut out = Vec::new();
        for (j, node) in self.nodes.iter().enumerate().skip(i + 1) {
            if node.depth <= depth {
                break;
            }
            if node.depth == depth + 1 {
                out.push(j);
            }
        }
        out
    }

    /// Index of the first node after the subtree rooted at `i`.
    pub fn subtree_end(&self, i: usize) -> usize {
        let depth = self.nodes[i].depth;
        let mut j = i + 1;
        while j < self.nodes.len() && self.nodes[j].depth > depth {
            j += 1;
        }
        j
    }
}

impl std::fmt::Display for TypeTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for node in &self.nodes {
            writeln!(
                f,
                "{:indent$}{} {} // size={}, array={}",
                "",
                node.type_name,
                node.name,
                node.byte_size,
                node.is_array,
                indent = node.depth as usize * 2
            )?;
        }
        Ok(())
    }
}

/// Legacy recursive wire form: each node is written in pre-order followed by
/// a child count. Depth comes from the recursion, not the stream.
#[instrument(name = "TypeTree_read_legacy", skip_all)]
pub(crate) fn read_legacy(cur: &mut ByteCursor, format: u32) -> Result<TypeTree> {
    let mut tree = TypeTree::default();
    read_legacy_node(cur, format, 0, &mut tree.nodes)?;
    Ok(tree)
}

fn read_legacy_node(
    cur: &mut ByteCursor,
    format: u32,
    depth: u8,
    out: &mut Vec<FieldNode>,
) -> Result<()> {
    if depth > MAX_TREE_DEPTH {
        return Err(Error::InvalidData("type tree nesting too deep".into()));
    }
    let type_name = cur.read_cstring()?;
    let name = cur.read_cstring()?;
    let byte_size = cur.read_i32()?;
    if format == 2 {
        let _variable_count = cur.read_i32()?;
    }
    let index = if format != 3 { cur.read_i32()? } else { 0 };
    let is_array = cur.read_i32()? != 0;
    let version = cur.read_i32()?;
    let meta_flags = if format != 3 {
        MetaFlags::from_bits_retain(cur.read_u32()?)
    } else {
        MetaFlags::empty()
    };
    out.push(FieldNode {
        type_name,
        name,
        byte_size,
        index,
        depth,
        is_array,
        version,
        meta_flags,
    });
    let children = cur.read_i32()?;
    if !(0..=MAX_NODE_COUNT).contains(&children) {
        return Err(Error::InvalidData(format!(
            "implausible child count {children}"
        )));
    }
    for _ in 0..children {
        read_legacy_node(cur, format, depth + 1, out)?;
    }
    Ok(())
}

const MAX_TREE_DEPTH: u8 = 64;
const MAX_NODE_COUNT: i32 = 0x40000;

/// Packed blob wire form: a flat array of fixed-size node records followed
/// by a shared string buffer. String references resolve either into the
/// local buffer or into the static common-string table; the sentinel bit in
/// the reference's upper half distinguishes the two.
#[instrument(name = "TypeTree_read_blob", skip_all)]
pub(crate) fn read_blob(cur: &mut ByteCursor, engine: UnityVersion) -> Result<TypeTree> {
    let node_count = cur.read_i32()?;
    let buffer_size = cur.read_i32()?;
    if !(0..=MAX_NODE_COUNT).contains(&node_count) || buffer_size < 0 {
        return Err(Error::InvalidData(format!(
            "implausible type tree blob: {node_count} nodes, {buffer_size} string bytes"
        )));
    }

    struct RawNode {
        version: u16,
        depth: u8,
        is_array: bool,
        type_ref: u32,
        name_ref: u32,
        byte_size: i32,
        index: i32,
        meta_flags: u32,
    }

    let has_ref_hash = engine >= UnityVersion::new(2019, 1, 0);
    let mut raw = Vec::with_capacity(node_count as usize);
    for _ in 0..node_count {
        let node = RawNode {
            version: cur.read_u16()?,
            depth: cur.read_u8()?,
            is_array: cur.read_u8()? != 0,
            type_ref: cur.read_u32()?,
            name_ref: cur.read_u32()?,
            byte_size: cur.read_i32()?,
            index: cur.read_i32()?,
            meta_flags: cur.read_u32()?,
        };
        if has_ref_hash {
            let _ref_type_hash = cur.read_u64()?;
        }
        raw.push(node);
    }
    let buffer = cur.read_bytes(buffer_size as usize)?;

    let mut tree = TypeTree {
        nodes: Vec::with_capacity(raw.len()),
    };
    for node in raw {
        tree.nodes.push(FieldNode {
            type_name: resolve_string(buffer, node.type_ref)?,
            name: resolve_string(buffer, node.name_ref)?,
            byte_size: node.byte_size,
            index: node.index,
            depth: node.depth,
            is_array: node.is_array,
            version: node.version as i32,
            meta_flags: MetaFlags::from_bits_retain(node.meta_flags),
        });
    }
    Ok(tree)
}

/// A string reference is (offset: u16, sentinel: u16). Sentinel clear means
/// an offset into the blob's own string buffer; sentinel set means an offset
/// into the shared common-string table. Treating every reference as a local
/// offset corrupts every node that uses the common table.
fn resolve_string(buffer: &[u8], reference: u32) -> Result<String> {
    const COMMON_SENTINEL: u32 = 0x8000_0000;
    let offset = reference & !COMMON_SENTINEL;
    if reference & COMMON_SENTINEL == 0 {
        let rest = buffer
            .get(offset as usize..)
            .ok_or_else(|| Error::InvalidData(format!("string offset {offset} out of range")))?;
        let nul = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        Ok(String::from_utf8_lossy(&rest[..nul]).into_owned())
    } else {
        Ok(common_string(offset)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("unknown<{offset}>")))
    }
}

/// The common-string table shipped by the producer: a fixed NUL-joined list
/// addressed by byte offset. The list order is part of the wire format and
/// must never change.
const COMMON_STRINGS: &[&str] = &[
    "AABB",
    "AnimationClip",
    "AnimationCurve",
    "AnimationState",
    "Array",
    "Base",
    "BitField",
    "bitset",
    "bool",
    "char",
    "ColorRGBA",
    "Component",
    "data",
    "deque",
    "double",
    "dynamic_array",
    "FastPropertyName",
    "first",
    "float",
    "Font",
    "GameObject",
    "Generic Mono",
    "GradientNEW",
    "GUID",
    "GUIStyle",
    "int",
    "list",
    "long long",
    "map",
    "Matrix4x4f",
    "MdFour",
    "MonoBehaviour",
    "MonoScript",
    "m_Bits",
    "m_BoneNameHashes",
    "m_BoneNames",
    "m_Bottom",
    "m_Component",
    "m_Data",
    "m_EditorClassIdentifier",
    "m_EditorHideFlags",
    "m_Enabled",
    "m_ExtensionPtr",
    "m_GameObject",
    "m_Index",
    "m_IsArray",
    "m_IsStatic",
    "m_MetaFlag",
    "m_Name",
    "m_ObjectHideFlags",
    "m_PrefabInternal",
    "m_PrefabParentObject",
    "m_Script",
    "m_StaticEditorFlags",
    "m_Type",
    "m_Version",
    "Object",
    "pair",
    "PPtr<Component>",
    "PPtr<GameObject>",
    "PPtr<Material>",
    "PPtr<MonoBehaviour>",
    "PPtr<MonoScript>",
    "PPtr<Object>",
    "PPtr<Prefab>",
    "PPtr<Sprite>",
    "PPtr<TextAsset>",
    "PPtr<Texture>",
    "PPtr<Texture2D>",
    "PPtr<Transform>",
    "Prefab",
    "Quaternionf",
    "Rectf",
    "RectInt",
    "RectOffset",
    "second",
    "set",
    "short",
    "size",
    "SInt16",
    "SInt32",
    "SInt64",
    "SInt8",
    "staticvector",
    "string",
    "TextAsset",
    "TextMesh",
    "Texture",
    "Texture2D",
    "Transform",
    "TypelessData",
    "UInt16",
    "UInt32",
    "UInt64",
    "UInt8",
    "unsigned int",
    "unsigned long long",
    "unsigned short",
    "vector",
    "Vector2f",
    "Vector3f",
    "Vector4f",
    "m_ScriptingClassIdentifier",
    "Gradient",
    "Type*",
    "int2_storage",
    "int3_storage",
    "BoundsInt",
    "m_CorrespondingSourceObject",
    "m_PrefabInstance",
    "m_PrefabAsset",
    "FileSize",
    "Hash128",
];

pub(crate) fn common_string(offset: u32) -> Option<&'static str> {
    static TABLE: OnceLock<HashMap<u32, &'static str>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            let mut table = HashMap::new();
            let mut offset = 0u32;
            for s in COMMON_STRINGS {
                table.insert(offset, *s);
                offset += s.len() as u32 + 1;
            }
            table
        })
        .get(&offset)
        .copied()
}

/// Byte offset of a common-table string, for encoders in tests.
#[cfg(test)]
pub(crate) fn common_string_offset(wanted: &str) -> Option<u32> {
    let mut offset = 0u32;
    for s in COMMON_STRINGS {
        if *s == wanted {
            return Some(offset);
        }
        offset += s.len() as u32 + 1;
    }
    None
}
