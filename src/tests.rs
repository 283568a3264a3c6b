use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use crate::dump::{self, Value};
use crate::script::{
    self, EngineValue, Primitive, ScriptField, ScriptFieldType, ScriptType, ScriptTypeRegistry,
};
use crate::{
    typetree, ByteCursor, ClassId, CrossRef, Endian, Error, ExternalLoader, LoadSession,
    SerializedFile, UnityVersion,
};

// ---------------------------------------------------------------------------
// wire-format encoders for fixtures

struct W {
    buf: Vec<u8>,
    little: bool,
}

impl W {
    fn new() -> Self {
        W {
            buf: Vec::new(),
            little: false,
        }
    }

    fn put(&mut self, be: &[u8], le: &[u8]) {
        self.buf.extend_from_slice(if self.little { le } else { be });
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn i16(&mut self, v: i16) {
        self.put(&v.to_be_bytes(), &v.to_le_bytes());
    }

    fn u16(&mut self, v: u16) {
        self.put(&v.to_be_bytes(), &v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_be_bytes(), &v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.put(&v.to_be_bytes(), &v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.put(&v.to_be_bytes(), &v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_be_bytes(), &v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.put(&v.to_be_bytes(), &v.to_le_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn aligned_str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
        self.align();
    }

    /// Pads to the next 4-byte boundary from buffer start, matching the
    /// reader's absolute alignment.
    fn align(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    fn pad_to(&mut self, len: usize) {
        assert!(self.buf.len() <= len);
        self.buf.resize(len, 0);
    }

    fn patch_u32_be(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }
}

#[derive(Clone)]
struct Node {
    type_name: &'static str,
    name: &'static str,
    depth: u8,
    is_array: bool,
    size: i32,
    meta: u32,
}

fn node(type_name: &'static str, name: &'static str, depth: u8) -> Node {
    Node {
        type_name,
        name,
        depth,
        is_array: false,
        size: -1,
        meta: 0,
    }
}

fn array(name: &'static str, depth: u8) -> Node {
    Node {
        type_name: "Array",
        name,
        depth,
        is_array: true,
        size: -1,
        meta: 0,
    }
}

fn write_blob_tree(w: &mut W, nodes: &[Node], with_ref_hash: bool) {
    let mut local = Vec::new();
    let mut local_offsets: HashMap<&str, u32> = HashMap::new();
    let mut string_ref = |s: &'static str, local: &mut Vec<u8>| -> u32 {
        if let Some(offset) = typetree::common_string_offset(s) {
            return 0x8000_0000 | offset;
        }
        *local_offsets.entry(s).or_insert_with(|| {
            let offset = local.len() as u32;
            local.extend_from_slice(s.as_bytes());
            local.push(0);
            offset
        })
    };
    let refs: Vec<(u32, u32)> = nodes
        .iter()
        .map(|n| {
            (
                string_ref(n.type_name, &mut local),
                string_ref(n.name, &mut local),
            )
        })
        .collect();
    w.i32(nodes.len() as i32);
    w.i32(local.len() as i32);
    for (i, (n, (type_ref, name_ref))) in nodes.iter().zip(refs).enumerate() {
        w.u16(1);
        w.u8(n.depth);
        w.u8(n.is_array as u8);
        w.u32(type_ref);
        w.u32(name_ref);
        w.i32(n.size);
        w.i32(i as i32);
        w.u32(n.meta);
        if with_ref_hash {
            w.u64(0);
        }
    }
    w.bytes(&local);
}

fn write_legacy_node(w: &mut W, nodes: &[Node], i: usize) -> usize {
    let n = &nodes[i];
    w.cstr(n.type_name);
    w.cstr(n.name);
    w.i32(n.size);
    w.i32(i as i32);
    w.i32(n.is_array as i32);
    w.i32(1);
    w.u32(n.meta);
    let mut end = i + 1;
    let mut count = 0;
    while end < nodes.len() && nodes[end].depth > n.depth {
        if nodes[end].depth == n.depth + 1 {
            count += 1;
        }
        end += 1;
    }
    w.i32(count);
    let mut child = i + 1;
    while child < end {
        child = write_legacy_node(w, nodes, child);
    }
    end
}

struct TypeSpec {
    class_id: i32,
    nodes: Vec<Node>,
}

struct ObjectSpec {
    path_id: i64,
    type_index: usize,
    payload: Vec<u8>,
}

struct Container {
    version: u32,
    engine: &'static str,
    little: bool,
    has_type_trees: bool,
    types: Vec<TypeSpec>,
    objects: Vec<ObjectSpec>,
    externals: Vec<&'static str>,
}

impl Container {
    fn new(version: u32) -> Self {
        Container {
            version,
            engine: "2017.4.3f1",
            little: true,
            has_type_trees: true,
            types: Vec::new(),
            objects: Vec::new(),
            externals: Vec::new(),
        }
    }

    fn ty(mut self, class_id: i32, nodes: Vec<Node>) -> Self {
        self.types.push(TypeSpec { class_id, nodes });
        self
    }

    fn obj(mut self, path_id: i64, type_index: usize, payload: Vec<u8>) -> Self {
        self.objects.push(ObjectSpec {
            path_id,
            type_index,
            payload,
        });
        self
    }

    fn external(mut self, path: &'static str) -> Self {
        self.externals.push(path);
        self
    }

    fn build(self) -> Vec<u8> {
        if self.version >= 9 {
            self.build_modern()
        } else {
            self.build_tail_metadata()
        }
    }

    fn write_types(&self, w: &mut W) {
        let v = self.version;
        w.i32(self.types.len() as i32);
        for t in &self.types {
            w.i32(t.class_id);
            if v >= 16 {
                w.u8(0);
            }
            if v >= 17 {
                w.i16(-1);
            }
            if v >= 13 {
                let is_script = if v < 16 {
                    t.class_id < 0
                } else {
                    t.class_id == ClassId::MonoBehaviour.id()
                };
                if is_script {
                    w.bytes(&[0u8; 16]);
                }
                w.bytes(&[0u8; 16]);
            }
            if self.has_type_trees {
                if v >= 12 || v == 10 {
                    let with_ref_hash =
                        self.engine.parse::<UnityVersion>().unwrap()
                            >= UnityVersion::new(2019, 1, 0);
                    write_blob_tree(w, &t.nodes, with_ref_hash);
                } else {
                    write_legacy_node(w, &t.nodes, 0);
                }
            }
        }
    }

    fn payload_starts(&self) -> Vec<u32> {
        let mut starts = Vec::new();
        let mut offset = 0u32;
        for o in &self.objects {
            starts.push(offset);
            offset = (offset + o.payload.len() as u32 + 7) & !7;
        }
        starts
    }

    fn build_modern(self) -> Vec<u8> {
        let v = self.version;
        let starts = self.payload_starts();
        let mut w = W::new();
        w.u32(0); // metadata size, patched below
        w.u32(0); // file size, patched below
        w.u32(v);
        w.u32(0); // data offset, patched below
        w.u8(if self.little { 0 } else { 1 });
        w.bytes(&[0; 3]);
        w.little = self.little;

        if v >= 7 {
            w.cstr(self.engine);
        }
        if v >= 8 {
            w.i32(5);
        }
        if v >= 13 {
            w.u8(self.has_type_trees as u8);
        }
        self.write_types(&mut w);
        if (7..14).contains(&v) {
            w.i32(0);
        }
        w.i32(self.objects.len() as i32);
        for (o, start) in self.objects.iter().zip(&starts) {
            if v >= 14 {
                w.align();
                w.i64(o.path_id);
            } else {
                w.i32(o.path_id as i32);
            }
            w.u32(*start);
            w.u32(o.payload.len() as u32);
            let type_id = if v >= 16 {
                o.type_index as i32
            } else {
                self.types[o.type_index].class_id
            };
            w.i32(type_id);
            if v < 16 {
                w.u16(self.types[o.type_index].class_id as u16);
            }
            if v < 11 {
                w.u16(0);
            }
            if (11..17).contains(&v) {
                w.i16(-1);
            }
            if v == 15 || v == 16 {
                w.u8(0);
            }
        }
        if v >= 11 {
            w.i32(0); // script references
        }
        w.i32(self.externals.len() as i32);
        for path in &self.externals {
            w.cstr("");
            w.bytes(&[0u8; 16]);
            w.i32(0);
            w.cstr(path);
        }
        w.cstr(""); // user information

        let metadata_end = w.buf.len();
        let data_offset = (metadata_end + 15) & !15;
        w.pad_to(data_offset);
        for (o, start) in self.objects.iter().zip(&starts) {
            w.pad_to(data_offset + *start as usize);
            w.bytes(&o.payload);
        }
        let file_size = w.buf.len() as u32;
        w.patch_u32_be(0, (metadata_end - 20) as u32);
        w.patch_u32_be(4, file_size);
        w.patch_u32_be(12, data_offset as u32);
        w.buf
    }

    /// Formats below 9 put the metadata block at the file tail, endian byte
    /// first, and record absolute object offsets.
    fn build_tail_metadata(self) -> Vec<u8> {
        assert!(!self.little, "old containers in these fixtures are big-endian");
        let v = self.version;
        let mut w = W::new();
        w.u32(0); // metadata size, patched below
        w.u32(0); // file size, patched below
        w.u32(v);
        w.u32(0); // data offset stays zero, offsets are absolute

        let mut starts = Vec::new();
        for o in &self.objects {
            w.pad_to((w.buf.len() + 7) & !7);
            starts.push(w.buf.len() as u32);
            w.bytes(&o.payload);
        }

        let metadata_start = w.buf.len();
        w.u8(1); // big-endian
        self.write_types(&mut w);
        w.i32(self.objects.len() as i32);
        for (o, start) in self.objects.iter().zip(&starts) {
            w.i32(o.path_id as i32);
            w.u32(*start);
            w.u32(o.payload.len() as u32);
            w.i32(self.types[o.type_index].class_id);
            w.u16(self.types[o.type_index].class_id as u16);
            w.u16(0); // destroyed flag
        }
        w.i32(self.externals.len() as i32);
        for path in &self.externals {
            w.cstr("");
            w.bytes(&[0u8; 16]);
            w.i32(0);
            w.cstr(path);
        }

        let file_size = w.buf.len() as u32;
        w.patch_u32_be(0, file_size - metadata_start as u32);
        w.patch_u32_be(4, file_size);
        w.buf
    }
}

fn simple_tree() -> Vec<Node> {
    vec![
        node("MonoBehaviour", "Base", 0),
        node("int", "a", 1),
        node("vector", "b", 1),
        array("Array", 2),
        node("int", "size", 3),
        node("int", "data", 3),
    ]
}

fn simple_payload(little: bool) -> Vec<u8> {
    let mut w = W::new();
    w.little = little;
    w.i32(7);
    w.i32(2);
    w.i32(1);
    w.i32(2);
    w.buf
}

fn parse(name: &str, bytes: Vec<u8>) -> SerializedFile {
    SerializedFile::parse(name, bytes).unwrap()
}

// ---------------------------------------------------------------------------
// engine versions

#[test]
fn version_parse_and_display() {
    let v: UnityVersion = "2019.4.12f1".parse().unwrap();
    assert_eq!(
        v,
        UnityVersion {
            major: 2019,
            minor: 4,
            patch: 12,
            kind: crate::ReleaseKind::Final,
            revision: 1
        }
    );
    assert_eq!(v.to_string(), "2019.4.12f1");
    // bare versions take a final release kind
    assert_eq!("5.6.3".parse::<UnityVersion>().unwrap(), {
        let mut v = UnityVersion::new(5, 6, 3);
        v.kind = crate::ReleaseKind::Final;
        v
    });
    assert!("not a version".parse::<UnityVersion>().is_err());
}

#[test]
fn version_order_follows_release_history() {
    let beta: UnityVersion = "5.6.3b4".parse().unwrap();
    let final_: UnityVersion = "5.6.3f2".parse().unwrap();
    let patch: UnityVersion = "5.6.3p1".parse().unwrap();
    assert!(beta < final_);
    assert!(final_ < patch);
    assert!(patch < "5.6.4f1".parse().unwrap());
    assert!("2017.4.3f1".parse::<UnityVersion>().unwrap() >= UnityVersion::new(2017, 4, 0));
    assert!("2017.4.3f1".parse::<UnityVersion>().unwrap() < UnityVersion::new(2018, 1, 0));
}

// ---------------------------------------------------------------------------
// cursor

proptest! {
    #[test]
    fn align_rounds_up_to_boundary(pos in 0usize..4096) {
        let data = vec![0u8; 4100];
        let mut cur = ByteCursor::new(&data, Endian::Little);
        cur.set_position(pos);
        cur.align();
        prop_assert_eq!(cur.position() % 4, 0);
        prop_assert!(cur.position() >= pos);
        prop_assert!(cur.position() - pos < 4);
    }

    #[test]
    fn aligned_string_round_trips(s in "\\PC{0,64}", prefix in 0usize..16) {
        let mut w = W::new();
        w.little = true;
        w.buf = vec![0; prefix];
        w.aligned_str(&s);
        let mut cur = ByteCursor::new(&w.buf, Endian::Little);
        cur.set_position(prefix);
        let got = cur.read_aligned_string().unwrap();
        prop_assert_eq!(got, s);
        prop_assert_eq!(cur.position() % 4, 0);
    }
}

#[test]
fn cursor_reports_eof_with_offset() {
    let data = [1u8, 2];
    let mut cur = ByteCursor::new(&data, Endian::Little);
    assert!(matches!(
        cur.read_u32(),
        Err(Error::UnexpectedEof { offset: 0 })
    ));
    // a huge declared string length must not wrap around
    let mut w = W::new();
    w.little = true;
    w.u32(u32::MAX);
    let mut cur = ByteCursor::new(&w.buf, Endian::Little);
    assert!(cur.read_aligned_string().is_err());
}

// ---------------------------------------------------------------------------
// type tree wire forms

#[test]
fn blob_resolves_common_and_local_strings() {
    let nodes = vec![node("MonoBehaviour", "Base", 0), node("int", "m_CustomField", 1)];
    let mut w = W::new();
    w.little = true;
    write_blob_tree(&mut w, &nodes, false);
    let mut cur = ByteCursor::new(&w.buf, Endian::Little);
    let tree = typetree::read_blob(&mut cur, UnityVersion::new(2017, 4, 0)).unwrap();
    assert_eq!(tree.nodes.len(), 2);
    assert_eq!(tree.nodes[0].type_name, "MonoBehaviour");
    assert_eq!(tree.nodes[0].name, "Base");
    assert_eq!(tree.nodes[1].type_name, "int");
    assert_eq!(tree.nodes[1].name, "m_CustomField");
    assert_eq!(cur.remaining(), 0);
}

#[test]
fn blob_skips_ref_hash_on_new_engines() {
    let nodes = simple_tree();
    let mut w = W::new();
    w.little = true;
    write_blob_tree(&mut w, &nodes, true);
    let mut cur = ByteCursor::new(&w.buf, Endian::Little);
    let tree = typetree::read_blob(&mut cur, UnityVersion::new(2019, 4, 0)).unwrap();
    assert_eq!(tree.nodes.len(), nodes.len());
    assert_eq!(tree.nodes[2].name, "b");
    assert_eq!(cur.remaining(), 0);
}

#[test]
fn legacy_and_blob_forms_decode_identically() {
    // nested dynamic arrays exercise the schema-replay path twice over
    let nodes = vec![
        node("MonoBehaviour", "Base", 0),
        node("vector", "m", 1),
        array("Array", 2),
        node("int", "size", 3),
        node("vector", "data", 3),
        array("Array", 4),
        node("int", "size", 5),
        node("int", "data", 5),
    ];
    let mut payload = W::new();
    for v in [2, 2, 1, 2, 1, 3] {
        payload.i32(v);
    }

    let old = Container {
        little: false,
        ..Container::new(6)
    }
    .ty(49, nodes.clone())
    .obj(10, 0, payload.buf.clone())
    .build();
    let old = parse("old.assets", old);
    assert!(!old.big_ids());

    let mut new_payload = W::new();
    new_payload.little = true;
    for v in [2, 2, 1, 2, 1, 3] {
        new_payload.i32(v);
    }
    let new = Container::new(17)
        .ty(49, nodes)
        .obj(10, 0, new_payload.buf)
        .build();
    let new = parse("new.assets", new);
    assert!(new.big_ids());

    // both wire forms flatten to the same node list
    let old_info = old.object(10).unwrap();
    let new_info = new.object(10).unwrap();
    assert_eq!(old.tree_for(old_info), new.tree_for(new_info));

    let mut old_reader = old.reader_for(10).unwrap();
    let mut new_reader = new.reader_for(10).unwrap();
    let old_value = dump::dump_object(&mut old_reader).unwrap();
    let new_value = dump::dump_object(&mut new_reader).unwrap();
    assert_eq!(old_value, new_value);
    let expected = Value::Array(vec![
        Value::Array(vec![Value::Int32(1), Value::Int32(2)]),
        Value::Array(vec![Value::Int32(3)]),
    ]);
    assert_eq!(old_value.get("m"), Some(&expected));
}

// ---------------------------------------------------------------------------
// container parsing

#[test]
fn rejects_unknown_format_versions() {
    let mut w = W::new();
    w.u32(0);
    w.u32(16);
    w.u32(23);
    w.u32(0);
    let err = SerializedFile::parse("future.assets", w.buf).unwrap_err();
    assert!(matches!(err.error, Error::Unsupported(_)));
}

#[test]
fn rejects_object_ranges_past_stream_end() {
    let mut bytes = Container::new(17)
        .ty(49, simple_tree())
        .obj(1, 0, simple_payload(true))
        .build();
    bytes.truncate(bytes.len() - 8);
    let err = SerializedFile::parse("torn.assets", bytes).unwrap_err();
    assert!(matches!(err.error, Error::Structural(_)));
    assert!(err.to_string().contains("offset"));
}

#[test]
fn parses_format_17_container() {
    let bytes = Container::new(17)
        .ty(49, simple_tree())
        .obj(1, 0, simple_payload(true))
        .external("Library/SharedAssets1.assets")
        .build();
    let file = parse("level0", bytes);
    assert_eq!(file.format_version(), 17);
    assert_eq!(file.unity_version(), "2017.4.3f1".parse().unwrap());
    assert_eq!(file.endian(), Endian::Little);
    assert!(file.big_ids());
    assert!(file.has_type_trees());
    assert_eq!(file.object_count(), 1);
    let info = file.object(1).unwrap();
    assert_eq!(info.class_id, ClassId::TextAsset);
    assert_eq!(info.byte_size, 16);
    assert_eq!(file.externals().len(), 1);
    assert_eq!(file.externals()[0].normalized_name(), "sharedassets1.assets");
    assert_eq!(file.object_bytes(info).len(), 16);
}

#[test]
fn big_endian_payloads_decode_the_same() {
    let little = Container::new(17)
        .ty(49, simple_tree())
        .obj(1, 0, simple_payload(true))
        .build();
    let big = Container {
        little: false,
        ..Container::new(17)
    }
    .ty(49, simple_tree())
    .obj(1, 0, simple_payload(false))
    .build();
    let little = parse("le.assets", little);
    let big = parse("be.assets", big);
    assert_eq!(big.endian(), Endian::Big);
    let a = dump::dump_object(&mut little.reader_for(1).unwrap()).unwrap();
    let b = dump::dump_object(&mut big.reader_for(1).unwrap()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn format_14_carries_64_bit_identities() {
    let wide_id = 0x1_0000_0001i64;
    let bytes = Container::new(14)
        .ty(49, simple_tree())
        .obj(wide_id, 0, simple_payload(true))
        .build();
    let file = parse("wide.assets", bytes);
    assert!(file.big_ids());
    assert!(file.object(wide_id).is_some());
    let value = dump::dump_object(&mut file.reader_for(wide_id).unwrap()).unwrap();
    assert_eq!(value.get("a"), Some(&Value::Int32(7)));
}

#[test]
fn format_12_has_no_tree_presence_flag() {
    // the flag byte only exists from format 13 on; 12 always embeds trees
    let bytes = Container::new(12)
        .ty(49, simple_tree())
        .obj(3, 0, simple_payload(true))
        .build();
    let file = parse("v12.assets", bytes);
    assert!(file.has_type_trees());
    assert!(!file.big_ids());
    let value = dump::dump_object(&mut file.reader_for(3).unwrap()).unwrap();
    assert_eq!(value.get("a"), Some(&Value::Int32(7)));
}

#[test]
fn stripped_container_keeps_objects_as_raw_bytes() {
    let bytes = Container {
        has_type_trees: false,
        ..Container::new(13)
    }
    .ty(49, Vec::new())
    .obj(5, 0, simple_payload(true))
    .build();
    let file = parse("stripped.assets", bytes);
    assert!(!file.has_type_trees());
    let info = file.object(5).unwrap();
    assert!(file.tree_for(info).is_none());
    assert_eq!(file.object_bytes(info).len(), 16);
    let mut reader = file.reader_for(5).unwrap();
    assert!(matches!(
        dump::dump_object(&mut reader),
        Err(Error::InvalidData(_))
    ));
}

#[test]
fn unrecognized_class_ids_are_retained() {
    let nodes = vec![node("Telemetry", "Base", 0), node("int", "x", 1)];
    let mut payload = W::new();
    payload.little = true;
    payload.i32(5);
    let bytes = Container::new(17).ty(9999, nodes).obj(8, 0, payload.buf).build();
    let file = parse("modded.assets", bytes);
    let info = file.object(8).unwrap();
    assert_eq!(info.class_id, ClassId::Unknown(9999));
    let value = dump::dump_object(&mut file.reader_for(8).unwrap()).unwrap();
    assert_eq!(value.get("x"), Some(&Value::Int32(5)));
}

#[test]
fn old_container_recovers_engine_version_from_build_settings() {
    let settings_tree = vec![
        node("BuildSettings", "Base", 0),
        node("string", "m_Version", 1),
    ];
    let mut payload = W::new();
    // absolute offset of the first payload byte is 16 in tail-metadata
    // fixtures, so in-payload alignment lines up with buffer alignment
    payload.buf = vec![0; 16];
    payload.aligned_str("5.0.1f1");
    let payload = payload.buf[16..].to_vec();
    let bytes = Container {
        little: false,
        ..Container::new(6)
    }
    .ty(141, settings_tree)
    .obj(1, 0, payload)
    .build();
    let file = parse("mainData", bytes);
    assert_eq!(file.unity_version(), "5.0.1f1".parse().unwrap());
    assert_eq!(file.version_string(), "");
}

#[test]
fn old_container_without_build_settings_uses_legacy_default() {
    let bytes = Container {
        little: false,
        ..Container::new(6)
    }
    .ty(49, simple_tree())
    .obj(1, 0, simple_payload(false))
    .build();
    let file = parse("mainData", bytes);
    assert_eq!(file.unity_version(), UnityVersion::legacy_default());
}

// ---------------------------------------------------------------------------
// schema-driven dumps

#[test]
fn dump_consumes_exactly_the_declared_range() {
    let bytes = Container::new(17)
        .ty(49, simple_tree())
        .obj(1, 0, simple_payload(true))
        .build();
    let file = parse("level0", bytes);
    let mut reader = file.reader_for(1).unwrap();
    let value = dump::dump_object(&mut reader).unwrap();
    assert_eq!(reader.position_in_object(), reader.object_len());
    assert_eq!(value.get("a"), Some(&Value::Int32(7)));
    assert_eq!(
        value.get("b"),
        Some(&Value::Array(vec![Value::Int32(1), Value::Int32(2)]))
    );
}

#[test]
fn dump_handles_strings_byte_arrays_and_refs() {
    let nodes = vec![
        node("TextAsset", "Base", 0),
        node("string", "m_Name", 1),
        node("vector", "m_Bytes", 1),
        array("Array", 2),
        node("int", "size", 3),
        node("UInt8", "data", 3),
        node("PPtr<Texture2D>", "m_Icon", 1),
    ];
    let mut payload = W::new();
    payload.little = true;
    payload.aligned_str("hello");
    payload.i32(3);
    payload.bytes(&[9, 8, 7]);
    payload.align();
    payload.i32(2); // external file index
    payload.i64(77);
    let bytes = Container::new(17).ty(49, nodes).obj(1, 0, payload.buf).build();
    let file = parse("level0", bytes);
    let mut reader = file.reader_for(1).unwrap();
    let value = dump::dump_object(&mut reader).unwrap();
    assert_eq!(reader.position_in_object(), reader.object_len());
    assert_eq!(value.find_string("m_Name"), Some("hello"));
    assert_eq!(value.get("m_Bytes"), Some(&Value::Bytes(vec![9, 8, 7])));
    assert_eq!(
        value.get("m_Icon"),
        Some(&Value::Ref(CrossRef {
            file_index: 2,
            path_id: 77
        }))
    );
}

#[test]
fn dump_rejects_counts_past_stream_end() {
    let mut payload = W::new();
    payload.little = true;
    payload.i32(7);
    payload.i32(0x0fff_ffff); // array count far beyond the stream
    let bytes = Container::new(17).ty(49, simple_tree()).obj(1, 0, payload.buf).build();
    let file = parse("hostile.assets", bytes);
    let mut reader = file.reader_for(1).unwrap();
    assert!(matches!(
        dump::dump_object(&mut reader),
        Err(Error::Structural(_))
    ));
}

#[test]
fn dump_values_serialize_as_json() {
    let bytes = Container::new(17)
        .ty(49, simple_tree())
        .obj(1, 0, simple_payload(true))
        .build();
    let file = parse("level0", bytes);
    let value = dump::dump_object(&mut file.reader_for(1).unwrap()).unwrap();
    let json = serde_json::to_value(&value).unwrap();
    assert_eq!(json[0]["name"], "a");
    assert_eq!(json[0]["type"], "int");
    assert_eq!(json[0]["value"], 7);
    assert_eq!(json[1]["value"][1], 2);
}

// ---------------------------------------------------------------------------
// load sessions and cross-references

struct CountingLoader {
    calls: AtomicUsize,
    files: HashMap<String, Arc<SerializedFile>>,
}

impl CountingLoader {
    fn new(files: impl IntoIterator<Item = Arc<SerializedFile>>) -> Self {
        CountingLoader {
            calls: AtomicUsize::new(0),
            files: files
                .into_iter()
                .map(|f| (f.name().to_owned(), f))
                .collect(),
        }
    }
}

impl ExternalLoader for CountingLoader {
    fn load(&self, name: &str) -> Option<Arc<SerializedFile>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.files.get(name).cloned()
    }
}

fn owner_and_target() -> (Arc<SerializedFile>, Arc<SerializedFile>) {
    let owner = Container::new(17)
        .ty(49, simple_tree())
        .obj(1, 0, simple_payload(true))
        .external("Library/SharedAssets1.assets")
        .external("missing.assets")
        .build();
    let target = Container::new(17)
        .ty(49, simple_tree())
        .obj(42, 0, simple_payload(true))
        .build();
    (
        Arc::new(parse("level0", owner)),
        Arc::new(parse("sharedassets1.assets", target)),
    )
}

#[test]
fn resolves_references_within_the_owning_container() {
    let (owner, _) = owner_and_target();
    let session = LoadSession::new();
    let local = CrossRef {
        file_index: 0,
        path_id: 1,
    };
    let target = local.resolve(&owner, &session).unwrap();
    assert_eq!(target.path_id(), 1);
    assert_eq!(target.file().name(), "level0");
    let value = dump::dump_object(&mut target.reader()).unwrap();
    assert_eq!(value.get("a"), Some(&Value::Int32(7)));
}

#[test]
fn null_references_resolve_to_none() {
    let (owner, _) = owner_and_target();
    let session = LoadSession::new();
    assert!(CrossRef::default().is_null());
    assert!(CrossRef::default().resolve(&owner, &session).is_none());
}

#[test]
fn external_lookup_is_memoized_per_slot() {
    let (owner, target) = owner_and_target();
    let loader = Arc::new(CountingLoader::new([target]));
    let session = LoadSession::with_loader(loader.clone());

    let external = CrossRef {
        file_index: 1,
        path_id: 42,
    };
    let first = external.resolve(&owner, &session).unwrap();
    let second = external.resolve(&owner, &session).unwrap();
    assert_eq!(first.path_id(), second.path_id());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

    // an identity miss in a loaded container does not re-run the lookup
    let absent = CrossRef {
        file_index: 1,
        path_id: 999,
    };
    assert!(absent.resolve(&owner, &session).is_none());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_externals_are_negative_cached() {
    let (owner, target) = owner_and_target();
    let loader = Arc::new(CountingLoader::new([target]));
    let session = LoadSession::with_loader(loader.clone());
    let gone = CrossRef {
        file_index: 2,
        path_id: 1,
    };
    assert!(gone.resolve(&owner, &session).is_none());
    assert!(gone.resolve(&owner, &session).is_none());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    // a file index with no external entry is a plain miss
    let wild = CrossRef {
        file_index: 9,
        path_id: 1,
    };
    assert!(wild.resolve(&owner, &session).is_none());
}

#[test]
fn concurrent_resolution_loads_each_external_once() {
    let (owner, target) = owner_and_target();
    let loader = Arc::new(CountingLoader::new([target]));
    let session = LoadSession::with_loader(loader.clone());
    let external = CrossRef {
        file_index: 1,
        path_id: 42,
    };
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let resolved = external.resolve(&owner, &session).unwrap();
                assert_eq!(resolved.path_id(), 42);
            });
        }
    });
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn session_deduplicates_by_normalized_name() {
    let (_, target) = owner_and_target();
    let session = LoadSession::new();
    let a = session.add(target.clone());
    let b = session.add(target);
    assert_eq!(a, b);
    assert_eq!(session.len(), 1);
}

// ---------------------------------------------------------------------------
// metadata-driven script decoding

struct MapRegistry(HashMap<(String, String), ScriptType>);

impl MapRegistry {
    fn single(ty: ScriptType) -> Self {
        let mut map = HashMap::new();
        map.insert((ty.assembly.clone(), ty.full_name.clone()), ty);
        MapRegistry(map)
    }
}

impl ScriptTypeRegistry for MapRegistry {
    fn get(&self, assembly: &str, full_name: &str) -> Option<&ScriptType> {
        self.0.get(&(assembly.to_owned(), full_name.to_owned()))
    }
}

fn script_field(name: &str, field_type: ScriptFieldType) -> ScriptField {
    ScriptField {
        name: name.to_owned(),
        field_type,
        is_public: true,
        is_static: false,
        is_init_only: false,
        has_serialize_marker: false,
        has_non_serialized_marker: false,
    }
}

fn script_container(engine: &'static str, payload: Vec<u8>) -> SerializedFile {
    let bytes = Container {
        engine,
        ..Container::new(17)
    }
    .ty(114, vec![node("MonoBehaviour", "Base", 0)])
    .obj(1, 0, payload)
    .build();
    parse("level0", bytes)
}

#[test]
fn field_eligibility_follows_producer_rules() {
    let mut f = script_field("plain", ScriptFieldType::Primitive(Primitive::Int32));
    assert!(f.is_serialized());
    f.is_static = true;
    assert!(!f.is_serialized());
    f.is_static = false;
    f.is_init_only = true;
    assert!(!f.is_serialized());
    f.is_init_only = false;
    f.has_non_serialized_marker = true;
    assert!(!f.is_serialized());
    f.has_non_serialized_marker = false;
    f.is_public = false;
    assert!(!f.is_serialized());
    f.has_serialize_marker = true;
    assert!(f.is_serialized());
}

#[test]
fn script_dump_decodes_eligible_fields_in_order() {
    let mut skipped = script_field("maxHealth", ScriptFieldType::Primitive(Primitive::Int32));
    skipped.is_static = true;
    let mut speed = script_field("speed", ScriptFieldType::Primitive(Primitive::Float));
    speed.is_public = false;
    speed.has_serialize_marker = true;
    let ty = ScriptType {
        assembly: "Assembly-CSharp".into(),
        full_name: "Game.Player".into(),
        fields: vec![
            script_field("health", ScriptFieldType::Primitive(Primitive::Int32)),
            skipped,
            speed,
            script_field("title", ScriptFieldType::Str),
            script_field("target", ScriptFieldType::EngineObject("GameObject".into())),
            script_field("tags", ScriptFieldType::List(Box::new(ScriptFieldType::Str))),
        ],
    };
    let mut payload = W::new();
    payload.little = true;
    payload.i32(100);
    payload.f32(2.5);
    payload.aligned_str("hero");
    payload.i32(0);
    payload.i64(0);
    payload.i32(2);
    payload.aligned_str("a");
    payload.aligned_str("bb");
    let file = script_container("2017.4.3f1", payload.buf);
    let mut reader = file.reader_for(1).unwrap();
    let registry = MapRegistry::single(ty);
    let dump =
        script::dump_script_object(&mut reader, "Assembly-CSharp", "Game.Player", &registry)
            .unwrap();
    assert!(dump.complete);
    assert_eq!(reader.position_in_object(), reader.object_len());
    assert_eq!(dump.value.get("health"), Some(&Value::Int32(100)));
    assert_eq!(dump.value.get("speed"), Some(&Value::Float(2.5)));
    assert_eq!(dump.value.get("maxHealth"), None);
    assert_eq!(dump.value.find_string("title"), Some("hero"));
    assert_eq!(dump.value.get("target"), Some(&Value::Ref(CrossRef::default())));
    assert_eq!(
        dump.value.get("tags"),
        Some(&Value::Array(vec![
            Value::String("a".into()),
            Value::String("bb".into())
        ]))
    );
}

#[test]
fn unsupported_field_truncates_that_object_only() {
    let ty = ScriptType {
        assembly: "Assembly-CSharp".into(),
        full_name: "Game.Weird".into(),
        fields: vec![
            script_field("a", ScriptFieldType::Primitive(Primitive::Int32)),
            script_field("blob", ScriptFieldType::Unsupported("System.Object".into())),
            script_field("c", ScriptFieldType::Primitive(Primitive::Int32)),
        ],
    };
    let mut payload = W::new();
    payload.little = true;
    payload.i32(7);
    payload.i32(1);
    payload.i32(2);
    let file = script_container("2017.4.3f1", payload.buf);
    let mut reader = file.reader_for(1).unwrap();
    let registry = MapRegistry::single(ty);
    let dump = script::dump_script_object(&mut reader, "Assembly-CSharp", "Game.Weird", &registry)
        .unwrap();
    assert!(!dump.complete);
    assert_eq!(dump.value.get("a"), Some(&Value::Int32(7)));
    assert_eq!(dump.value.get("c"), None);
}

#[test]
fn nested_script_classes_decode_inline() {
    let inner = ScriptType {
        assembly: "Assembly-CSharp".into(),
        full_name: "Game.Stat".into(),
        fields: vec![
            script_field("base_", ScriptFieldType::Primitive(Primitive::Int32)),
            script_field("bonus", ScriptFieldType::Primitive(Primitive::Int32)),
        ],
    };
    let outer = ScriptType {
        assembly: "Assembly-CSharp".into(),
        full_name: "Game.Unit".into(),
        fields: vec![script_field("strength", ScriptFieldType::Nested("Game.Stat".into()))],
    };
    let mut registry = MapRegistry::single(inner);
    registry
        .0
        .insert(("Assembly-CSharp".into(), "Game.Unit".into()), outer);
    let mut payload = W::new();
    payload.little = true;
    payload.i32(10);
    payload.i32(3);
    let file = script_container("2017.4.3f1", payload.buf);
    let mut reader = file.reader_for(1).unwrap();
    let dump = script::dump_script_object(&mut reader, "Assembly-CSharp", "Game.Unit", &registry)
        .unwrap();
    assert!(dump.complete);
    let strength = dump.value.get("strength").unwrap();
    assert_eq!(strength.get("base_"), Some(&Value::Int32(10)));
    assert_eq!(strength.get("bonus"), Some(&Value::Int32(3)));
}

#[test]
fn keyframes_gain_weights_in_2018_1() {
    let curve_type = || ScriptType {
        assembly: "Assembly-CSharp".into(),
        full_name: "Game.Fade".into(),
        fields: vec![script_field(
            "curve",
            ScriptFieldType::EngineValue(EngineValue::AnimationCurve),
        )],
    };
    let key = |w: &mut W| {
        w.f32(0.0);
        w.f32(1.0);
        w.f32(0.0);
        w.f32(0.0);
    };
    let tail = |w: &mut W| {
        w.i32(2);
        w.i32(2);
        w.i32(4); // rotation order, engines 5.3 and up
    };

    let mut old = W::new();
    old.little = true;
    old.i32(1);
    key(&mut old);
    tail(&mut old);
    let file = script_container("2017.4.3f1", old.buf);
    let mut reader = file.reader_for(1).unwrap();
    let dump =
        script::dump_script_object(&mut reader, "Assembly-CSharp", "Game.Fade", &MapRegistry::single(curve_type()))
            .unwrap();
    assert!(dump.complete);
    assert_eq!(reader.position_in_object(), reader.object_len());
    let keys = dump.value.get("curve").unwrap().get("m_Curve").unwrap();
    let Value::Array(keys) = keys else { panic!() };
    assert!(keys[0].get("weightedMode").is_none());

    let mut new = W::new();
    new.little = true;
    new.i32(1);
    key(&mut new);
    new.i32(0); // weightedMode
    new.f32(1.0);
    new.f32(1.0);
    tail(&mut new);
    let file = script_container("2018.1.0f1", new.buf);
    let mut reader = file.reader_for(1).unwrap();
    let dump =
        script::dump_script_object(&mut reader, "Assembly-CSharp", "Game.Fade", &MapRegistry::single(curve_type()))
            .unwrap();
    assert!(dump.complete);
    assert_eq!(reader.position_in_object(), reader.object_len());
    let keys = dump.value.get("curve").unwrap().get("m_Curve").unwrap();
    let Value::Array(keys) = keys else { panic!() };
    assert_eq!(keys[0].get("weightedMode"), Some(&Value::Int32(0)));
}

#[test]
fn behaviour_header_precedes_script_fields() {
    let mut payload = W::new();
    payload.little = true;
    payload.i32(0);
    payload.i64(3); // m_GameObject
    payload.u8(1); // m_Enabled
    payload.align();
    payload.i32(0);
    payload.i64(11); // m_Script
    payload.aligned_str("Foo");
    let file = script_container("2017.4.3f1", payload.buf);
    let mut reader = file.reader_for(1).unwrap();
    let header = script::read_behaviour_header(&mut reader).unwrap();
    assert_eq!(header.game_object.path_id, 3);
    assert!(header.enabled);
    assert_eq!(header.script.path_id, 11);
    assert_eq!(header.name, "Foo");
    assert_eq!(reader.position_in_object(), reader.object_len());
}
