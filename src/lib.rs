/*!
A library for reading Unity serialized asset files.

One [`SerializedFile`] is one parsed container: a version-gated header, the
catalog of embedded type schemas ([`TypeTree`]), and a flat object table
mapping 64-bit identities to byte ranges. Objects are decoded on demand
through an [`ObjectReader`] scoped to their byte range, either generically
from the embedded schema ([`dump::dump_object`]) or, for user-script
instances without an informative schema, from externally loaded compiled
type metadata ([`script::dump_script_object`]).

Objects reference each other through [`CrossRef`] values (a file index plus
an identity), resolved lazily against a [`LoadSession`] that owns every
loaded container.

# Example

```no_run
use unasset::{dump, SerializedFile};

let bytes = std::fs::read("sharedassets0.assets")?;
let file = SerializedFile::parse("sharedassets0.assets", bytes)?;
for info in file.objects() {
    if let Some(mut reader) = file.reader_for(info.path_id) {
        if let Ok(value) = dump::dump_object(&mut reader) {
            println!("{} ({:?}): {}", info.path_id, info.class_id, value);
        }
    }
}
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

pub mod cursor;
pub mod dump;
pub mod script;
pub mod session;

mod error;
mod typetree;

#[cfg(test)]
mod tests;

pub use cursor::{ByteCursor, Endian, ObjectReader};
pub use error::{Error, ParseError};
pub use session::{ExternalLoader, LoadSession, ObjectRef};
pub use typetree::{FieldNode, MetaFlags, TypeTree};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, instrument, warn};

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Highest header format version this reader understands.
pub const MAX_FORMAT_VERSION: u32 = 22;

/// Release kind of an engine version, ordered by the producer's historical
/// release order within one patch level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReleaseKind {
    Alpha,
    Beta,
    Final,
    Patch,
}

impl ReleaseKind {
    fn from_char(c: char) -> Self {
        match c {
            'a' => Self::Alpha,
            'b' => Self::Beta,
            'p' => Self::Patch,
            _ => Self::Final,
        }
    }

    fn as_char(self) -> char {
        match self {
            Self::Alpha => 'a',
            Self::Beta => 'b',
            Self::Final => 'f',
            Self::Patch => 'p',
        }
    }
}

/// The engine version parsed from a container's free-text version string,
/// e.g. `5.6.3p1` or `2019.4.12f1`.
///
/// The derived ordering (major, minor, patch, release kind, revision)
/// matches the producer's historical format evolution order, which lexical
/// string order does not ("5.6.3b4" < "5.6.3f2" < "5.6.3p1").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnityVersion {
    pub major: u16,
    pub minor: u8,
    pub patch: u8,
    pub kind: ReleaseKind,
    pub revision: u8,
}

impl UnityVersion {
    pub const fn new(major: u16, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
            kind: ReleaseKind::Final,
            revision: 0,
        }
    }

    /// What containers predating embedded version strings actually were.
    pub const fn legacy_default() -> Self {
        Self {
            major: 2,
            minor: 5,
            patch: 0,
            kind: ReleaseKind::Final,
            revision: 5,
        }
    }
}

impl std::str::FromStr for UnityVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidData(format!("malformed version string {s:?}"));
        let mut parts = s.trim().splitn(3, '.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let rest = parts.next().ok_or_else(invalid)?;
        match rest.find(|c: char| c.is_ascii_alphabetic()) {
            Some(split) => {
                let patch = rest[..split].parse().map_err(|_| invalid())?;
                let kind = ReleaseKind::from_char(rest.as_bytes()[split] as char);
                // revision digits may be followed by a vendor suffix
                let digits: String = rest[split + 1..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                let revision = digits.parse().unwrap_or(0);
                Ok(Self {
                    major,
                    minor,
                    patch,
                    kind,
                    revision,
                })
            }
            None => Ok(Self {
                major,
                minor,
                patch: rest.parse().map_err(|_| invalid())?,
                kind: ReleaseKind::Final,
                revision: 0,
            }),
        }
    }
}

impl std::fmt::Display for UnityVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}{}{}",
            self.major,
            self.minor,
            self.patch,
            self.kind.as_char(),
            self.revision
        )
    }
}

impl Serialize for UnityVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UnityVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl Visitor<'_> for VersionVisitor {
            type Value = UnityVersion;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an engine version string like 2019.4.12f1")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(VersionVisitor)
    }
}

/// Platform the container was built for. Values outside the recognized set
/// degrade to [`BuildTarget::Unknown`], never a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildTarget {
    NoTarget,
    StandaloneOsx,
    StandaloneWindows,
    WebPlayer,
    Ios,
    Android,
    StandaloneWindows64,
    WebGl,
    WsaPlayer,
    StandaloneLinux64,
    Ps4,
    XboxOne,
    Switch,
    Unknown(i32),
}

impl From<i32> for BuildTarget {
    fn from(value: i32) -> Self {
        match value {
            2 => Self::StandaloneOsx,
            5 => Self::StandaloneWindows,
            6 => Self::WebPlayer,
            9 => Self::Ios,
            13 => Self::Android,
            19 => Self::StandaloneWindows64,
            20 => Self::WebGl,
            21 => Self::WsaPlayer,
            24 => Self::StandaloneLinux64,
            31 => Self::Ps4,
            33 => Self::XboxOne,
            38 => Self::Switch,
            other => Self::Unknown(other),
        }
    }
}

macro_rules! class_ids {
    ($($name:ident = $id:expr,)*) => {
        /// Engine object kinds recognized by this reader. Unrecognized class
        /// ids are retained as [`ClassId::Unknown`]; such objects stay in the
        /// object table and remain decodable through their embedded schema.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum ClassId {
            $($name,)*
            Unknown(i32),
        }

        impl ClassId {
            pub fn from_id(id: i32) -> Self {
                match id {
                    $($id => Self::$name,)*
                    other => Self::Unknown(other),
                }
            }

            pub fn id(self) -> i32 {
                match self {
                    $(Self::$name => $id,)*
                    Self::Unknown(other) => other,
                }
            }
        }
    };
}

class_ids! {
    GameObject = 1,
    Transform = 4,
    Camera = 20,
    Material = 21,
    MeshRenderer = 23,
    Texture2D = 28,
    Mesh = 43,
    Shader = 48,
    TextAsset = 49,
    AnimationClip = 74,
    AudioClip = 83,
    Animator = 95,
    MonoBehaviour = 114,
    MonoScript = 115,
    Font = 128,
    BuildSettings = 141,
    AssetBundle = 142,
    ResourceManager = 147,
    Sprite = 213,
}

impl ClassId {
    /// User-script instances carry their field layout in compiled metadata,
    /// not in the embedded schema.
    pub fn is_script(self) -> bool {
        self == Self::MonoBehaviour
    }
}

/// An unresolved reference to another object: local file index (0 = the
/// owning container) plus object identity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrossRef {
    pub file_index: i32,
    pub path_id: i64,
}

impl CrossRef {
    pub fn is_null(&self) -> bool {
        self.path_id == 0
    }

    /// Resolves against the owning container and the session that loaded
    /// it. A miss is an absent reference, never an error; see
    /// [`LoadSession::resolve`].
    pub fn resolve(
        &self,
        owner: &std::sync::Arc<SerializedFile>,
        session: &LoadSession,
    ) -> Option<ObjectRef> {
        session.resolve(owner, *self)
    }
}

/// The fixed container header. Always big-endian on the wire; the rest of
/// the metadata follows the declared byte order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub metadata_size: u32,
    pub file_size: u64,
    /// Serialized-file format version; most structural gates branch on this.
    pub version: u32,
    pub data_offset: u64,
    pub endian: Endian,
}

/// One entry of the container's type catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedType {
    pub class_id: i32,
    pub is_stripped: bool,
    pub script_type_index: Option<i16>,
    pub script_id: Option<[u8; 16]>,
    pub old_type_hash: Option<[u8; 16]>,
    pub tree: Option<TypeTree>,
}

/// One object-table entry: identity mapped to a byte range and a type
/// reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub path_id: i64,
    /// Byte offset relative to the container's data offset.
    pub byte_start: u64,
    pub byte_size: u32,
    /// Type-catalog index (format >= 16) or raw class id (older formats).
    pub type_id: i32,
    pub class_id: ClassId,
    pub is_destroyed: bool,
    pub script_type_index: Option<i16>,
    pub is_stripped: bool,
}

/// One externally-referenced container, resolved by name through the load
/// session when a [`CrossRef`] with a positive file index is followed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalFile {
    pub guid: [u8; 16],
    pub kind: i32,
    pub path: String,
}

impl ExternalFile {
    /// Lookup key in the load session: final path component, lowercased.
    pub fn normalized_name(&self) -> String {
        session::normalize_name(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExternalSlot {
    Unresolved,
    Missing,
    Loaded(usize),
}

/// One parsed container: header, type catalog, object table and external
/// references. Immutable after construction except for the memoized
/// external-reference slots; decoding never mutates container state, so
/// objects can be decoded in parallel as long as each uses its own
/// [`ObjectReader`].
#[derive(Debug)]
pub struct SerializedFile {
    name: String,
    data: Vec<u8>,
    header: Header,
    version_string: String,
    unity_version: UnityVersion,
    target_platform: BuildTarget,
    has_type_trees: bool,
    big_ids: bool,
    types: Vec<SerializedType>,
    objects: IndexMap<i64, ObjectInfo>,
    script_refs: Vec<CrossRef>,
    externals: Vec<ExternalFile>,
    user_information: String,
    external_slots: Mutex<Vec<ExternalSlot>>,
}

struct Metadata {
    header: Header,
    version_string: String,
    unity_version: UnityVersion,
    target_platform: BuildTarget,
    has_type_trees: bool,
    big_ids: bool,
    types: Vec<SerializedType>,
    objects: IndexMap<i64, ObjectInfo>,
    script_refs: Vec<CrossRef>,
    externals: Vec<ExternalFile>,
    user_information: String,
}

const MAX_ENTRY_COUNT: i32 = 0x100000;

fn read_count(cur: &mut ByteCursor, what: &str) -> Result<usize> {
    let count = cur.read_i32()?;
    if !(0..=MAX_ENTRY_COUNT).contains(&count) {
        return Err(Error::Structural(format!(
            "implausible {what} count {count}"
        )));
    }
    Ok(count as usize)
}

impl SerializedFile {
    /// Parses one archive byte stream. A malformed archive is an error the
    /// caller is expected to skip; real-world archive sets routinely contain
    /// unrelated or partially corrupt files, and one bad container must
    /// never abort its siblings.
    #[instrument(name = "SerializedFile_parse", skip_all)]
    pub fn parse(name: impl Into<String>, data: Vec<u8>) -> Result<Self, ParseError> {
        let name = name.into();
        let meta = {
            let mut cur = ByteCursor::new(&data, Endian::Big);
            match Self::parse_metadata(&data, &mut cur) {
                Ok(meta) => meta,
                Err(error) => {
                    return Err(ParseError {
                        offset: cur.position(),
                        error,
                    })
                }
            }
        };
        debug!(
            name = %name,
            format = meta.header.version,
            engine = %meta.unity_version,
            objects = meta.objects.len(),
            "parsed container"
        );
        let slots = vec![ExternalSlot::Unresolved; meta.externals.len()];
        Ok(Self {
            name,
            data,
            header: meta.header,
            version_string: meta.version_string,
            unity_version: meta.unity_version,
            target_platform: meta.target_platform,
            has_type_trees: meta.has_type_trees,
            big_ids: meta.big_ids,
            types: meta.types,
            objects: meta.objects,
            script_refs: meta.script_refs,
            externals: meta.externals,
            user_information: meta.user_information,
            external_slots: Mutex::new(slots),
        })
    }

    fn parse_metadata(data: &[u8], cur: &mut ByteCursor) -> Result<Metadata> {
        let metadata_size = cur.read_u32()?;
        let mut file_size = cur.read_u32()? as u64;
        let version = cur.read_u32()?;
        let mut data_offset = cur.read_u32()? as u64;
        if version == 0 || version > MAX_FORMAT_VERSION {
            return Err(Error::Unsupported(format!("format version {version}")));
        }

        let endian = if version >= 9 {
            let endian = read_endian(cur)?;
            cur.read_bytes(3)?;
            endian
        } else {
            // old layout: the metadata block, endian byte first, sits at the
            // file tail
            let meta_at = file_size
                .checked_sub(metadata_size as u64)
                .ok_or_else(|| Error::Structural("metadata size exceeds file size".into()))?;
            cur.set_position(meta_at as usize);
            read_endian(cur)?
        };
        if version >= 22 {
            let _metadata_size = cur.read_u32()?;
            file_size = cur.read_i64()? as u64;
            data_offset = cur.read_i64()? as u64;
            let _reserved = cur.read_i64()?;
        }
        if file_size != cur.len() as u64 {
            warn!(
                declared = file_size,
                actual = cur.len(),
                "header file size disagrees with stream length"
            );
        }
        cur.set_endian(endian);

        let version_string = if version >= 7 {
            cur.read_cstring()?
        } else {
            String::new()
        };
        let mut unity_version = if version >= 7 {
            version_string.parse().unwrap_or_else(|_| {
                warn!(%version_string, "unparseable engine version string");
                UnityVersion::legacy_default()
            })
        } else {
            UnityVersion::legacy_default()
        };
        let target_platform = if version >= 8 {
            BuildTarget::from(cur.read_i32()?)
        } else {
            BuildTarget::NoTarget
        };
        let has_type_trees = if version >= 13 { cur.read_bool()? } else { true };

        let type_count = read_count(cur, "type")?;
        let mut types = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            types.push(read_type(cur, version, unity_version, has_type_trees, false)?);
        }

        let big_id_flag = (7..14).contains(&version) && cur.read_i32()? != 0;
        let big_ids = version >= 14 || big_id_flag;

        let object_count = read_count(cur, "object")?;
        let mut objects = IndexMap::with_capacity(object_count);
        for _ in 0..object_count {
            let path_id = if big_id_flag {
                cur.read_i64()?
            } else if version < 14 {
                cur.read_i32()? as i64
            } else {
                cur.align();
                cur.read_i64()?
            };
            let byte_start = if version >= 22 {
                cur.read_i64()? as u64
            } else {
                cur.read_u32()? as u64
            };
            let byte_size = cur.read_u32()?;
            let type_id = cur.read_i32()?;
            let class_id = if version < 16 {
                ClassId::from_id(cur.read_u16()? as i32)
            } else {
                let ty = types.get(type_id as usize).ok_or_else(|| {
                    Error::Structural(format!("object type index {type_id} out of range"))
                })?;
                ClassId::from_id(ty.class_id)
            };
            let is_destroyed = version < 11 && cur.read_u16()? != 0;
            let script_type_index = if (11..17).contains(&version) {
                Some(cur.read_i16()?)
            } else {
                None
            };
            let is_stripped = (version == 15 || version == 16) && cur.read_u8()? != 0;

            let end = data_offset
                .checked_add(byte_start)
                .and_then(|s| s.checked_add(byte_size as u64))
                .ok_or_else(|| Error::Structural("object byte range overflows".into()))?;
            if end > data.len() as u64 {
                return Err(Error::Structural(format!(
                    "object {path_id} byte range [{byte_start}..+{byte_size}) exceeds stream length"
                )));
            }
            if let ClassId::Unknown(id) = class_id {
                debug!(path_id, class_id = id, "object of unrecognized kind");
            }
            objects.insert(
                path_id,
                ObjectInfo {
                    path_id,
                    byte_start,
                    byte_size,
                    type_id,
                    class_id,
                    is_destroyed,
                    script_type_index,
                    is_stripped,
                },
            );
        }

        let mut script_refs = Vec::new();
        if version >= 11 {
            let count = read_count(cur, "script reference")?;
            for _ in 0..count {
                let file_index = cur.read_i32()?;
                let path_id = if version < 14 {
                    cur.read_i32()? as i64
                } else {
                    cur.align();
                    cur.read_i64()?
                };
                script_refs.push(CrossRef {
                    file_index,
                    path_id,
                });
            }
        }

        let external_count = read_count(cur, "external")?;
        let mut externals = Vec::with_capacity(external_count);
        for _ in 0..external_count {
            if version >= 6 {
                let _legacy_name = cur.read_cstring()?;
            }
            let (guid, kind) = if version >= 5 {
                let mut guid = [0u8; 16];
                guid.copy_from_slice(cur.read_bytes(16)?);
                (guid, cur.read_i32()?)
            } else {
                ([0u8; 16], 0)
            };
            let path = cur.read_cstring()?;
            externals.push(ExternalFile { guid, kind, path });
        }

        let user_information = if version >= 5 && cur.remaining() > 0 {
            cur.read_cstring().unwrap_or_default()
        } else {
            String::new()
        };

        // Containers older than the version-string header carry their
        // human-readable engine version only inside the build settings
        // object. Recover it now so every later engine-level gate in this
        // container sees the right version.
        if version < 7 {
            if let Some(recovered) =
                bootstrap_engine_version(data, data_offset, endian, &types, &objects)
            {
                debug!(engine = %recovered, "recovered engine version from build settings");
                unity_version = recovered;
            }
        }

        Ok(Metadata {
            header: Header {
                metadata_size,
                file_size,
                version,
                data_offset,
                endian,
            },
            version_string,
            unity_version,
            target_platform,
            has_type_trees,
            big_ids,
            types,
            objects,
            script_refs,
            externals,
            user_information,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Serialized-file format version from the header.
    pub fn format_version(&self) -> u32 {
        self.header.version
    }

    /// Raw engine version string; empty for containers predating it.
    pub fn version_string(&self) -> &str {
        &self.version_string
    }

    pub fn unity_version(&self) -> UnityVersion {
        self.unity_version
    }

    pub fn target_platform(&self) -> BuildTarget {
        self.target_platform
    }

    pub fn endian(&self) -> Endian {
        self.header.endian
    }

    /// Whether object identities and cross-reference identities are 64-bit.
    pub fn big_ids(&self) -> bool {
        self.big_ids
    }

    /// Whether the container embeds type trees at all; stripped builds omit
    /// them and leave only compiled metadata to describe script objects.
    pub fn has_type_trees(&self) -> bool {
        self.has_type_trees
    }

    pub fn types(&self) -> &[SerializedType] {
        &self.types
    }

    /// Object-table entries in file order.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectInfo> {
        self.objects.values()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn object(&self, path_id: i64) -> Option<&ObjectInfo> {
        self.objects.get(&path_id)
    }

    pub fn script_refs(&self) -> &[CrossRef] {
        &self.script_refs
    }

    pub fn externals(&self) -> &[ExternalFile] {
        &self.externals
    }

    pub fn user_information(&self) -> &str {
        &self.user_information
    }

    /// The type-catalog entry for an object: a direct index for format >= 16,
    /// a class-id search for older formats.
    pub fn type_for(&self, info: &ObjectInfo) -> Option<&SerializedType> {
        if self.header.version >= 16 {
            self.types.get(info.type_id as usize)
        } else {
            self.types.iter().find(|t| t.class_id == info.type_id)
        }
    }

    pub fn tree_for(&self, info: &ObjectInfo) -> Option<&TypeTree> {
        self.type_for(info).and_then(|t| t.tree.as_ref())
    }

    /// The raw payload bytes of one object; the only view available for
    /// unknown kinds without an embedded schema.
    pub fn object_bytes(&self, info: &ObjectInfo) -> &[u8] {
        let start = (self.header.data_offset + info.byte_start) as usize;
        &self.data[start..start + info.byte_size as usize]
    }

    /// A cursor scoped to one object's byte range. Positions stay absolute
    /// within the stream so alignment padding stays in sync with the
    /// producer's writer.
    pub fn reader_for(&self, path_id: i64) -> Option<ObjectReader<'_>> {
        let info = self.objects.get(&path_id)?;
        Some(self.reader_for_info(info))
    }

    pub fn reader_for_info<'a>(&'a self, info: &'a ObjectInfo) -> ObjectReader<'a> {
        let start = (self.header.data_offset + info.byte_start) as usize;
        ObjectReader::new(
            self,
            info,
            self.tree_for(info),
            &self.data,
            start,
            self.header.endian,
        )
    }

    /// Session index of the container behind a positive cross-reference
    /// file index, memoized per external slot. A failed lookup is terminal:
    /// the slot stays missing and is never re-derived.
    pub(crate) fn external_session_index(
        &self,
        file_index: i32,
        session: &LoadSession,
    ) -> Option<usize> {
        let slot = (file_index as usize).checked_sub(1)?;
        let external = self.externals.get(slot)?;
        let mut slots = self.external_slots.lock();
        match slots[slot] {
            ExternalSlot::Loaded(index) => Some(index),
            ExternalSlot::Missing => None,
            ExternalSlot::Unresolved => {
                let resolved = session.lookup(&external.path);
                slots[slot] = match resolved {
                    Some(index) => ExternalSlot::Loaded(index),
                    None => ExternalSlot::Missing,
                };
                resolved
            }
        }
    }
}

fn read_endian(cur: &mut ByteCursor) -> Result<Endian> {
    Ok(if cur.read_u8()? == 0 {
        Endian::Little
    } else {
        Endian::Big
    })
}

fn read_type(
    cur: &mut ByteCursor,
    format: u32,
    engine: UnityVersion,
    has_type_trees: bool,
    is_ref_type: bool,
) -> Result<SerializedType> {
    let class_id = cur.read_i32()?;
    let is_stripped = format >= 16 && cur.read_bool()?;
    let script_type_index = if format >= 17 {
        Some(cur.read_i16()?)
    } else {
        None
    };
    let mut script_id = None;
    let mut old_type_hash = None;
    if format >= 13 {
        let is_script = if is_ref_type {
            script_type_index.is_some_and(|i| i >= 0)
        } else if format < 16 {
            class_id < 0
        } else {
            class_id == ClassId::MonoBehaviour.id()
        };
        if is_script {
            let mut hash = [0u8; 16];
            hash.copy_from_slice(cur.read_bytes(16)?);
            script_id = Some(hash);
        }
        let mut hash = [0u8; 16];
        hash.copy_from_slice(cur.read_bytes(16)?);
        old_type_hash = Some(hash);
    }
    let tree = if has_type_trees {
        let tree = if format >= 12 || format == 10 {
            typetree::read_blob(cur, engine)?
        } else {
            typetree::read_legacy(cur, format)?
        };
        if format >= 21 {
            if is_ref_type {
                let _class_name = cur.read_cstring()?;
                let _namespace = cur.read_cstring()?;
                let _assembly = cur.read_cstring()?;
            } else {
                let count = read_count(cur, "type dependency")?;
                for _ in 0..count {
                    let _dependency = cur.read_i32()?;
                }
            }
        }
        Some(tree)
    } else {
        None
    };
    Ok(SerializedType {
        class_id,
        is_stripped,
        script_type_index,
        script_id,
        old_type_hash,
        tree,
    })
}

/// One-time bootstrap for containers without a header version string: the
/// build settings object, when present, is decoded immediately through its
/// embedded schema to lift out `m_Version`.
fn bootstrap_engine_version(
    data: &[u8],
    data_offset: u64,
    endian: Endian,
    types: &[SerializedType],
    objects: &IndexMap<i64, ObjectInfo>,
) -> Option<UnityVersion> {
    let info = objects
        .values()
        .find(|o| o.class_id == ClassId::BuildSettings)?;
    let ty = types.iter().find(|t| t.class_id == info.type_id)?;
    let tree = ty.tree.as_ref()?;
    let mut cur = ByteCursor::new(data, endian);
    cur.set_position((data_offset + info.byte_start) as usize);
    let value = match dump::dump_tree(tree, &mut cur, false) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, "failed to decode build settings during version bootstrap");
            return None;
        }
    };
    value.find_string("m_Version")?.parse().ok()
}
