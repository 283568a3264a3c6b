use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::{ClassId, CrossRef, Error, ObjectInfo, Result, SerializedFile, TypeTree};

/// Byte order declared by a container. Most shipped archives are
/// little-endian; the header itself is always big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endian {
    Big,
    Little,
}

/// Endian-aware reader over an in-memory stream.
///
/// Positions are absolute within the underlying stream. [`ByteCursor::align`]
/// rounds the position up to the next 4-byte boundary *from stream start*;
/// every aligned string/array read in the wire format relies on this, and an
/// object-relative alignment would silently corrupt subsequent fields.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

macro_rules! read_fixed {
    ($name:ident, $ty:ty, $width:expr, $be:ident, $le:ident) => {
        pub fn $name(&mut self) -> Result<$ty> {
            let bytes = self.take($width)?;
            Ok(match self.endian {
                Endian::Big => BigEndian::$be(bytes),
                Endian::Little => LittleEndian::$le(bytes),
            })
        }
    };
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// O(1) absolute seek. Seeking past the end is permitted; the next read
    /// reports the overrun.
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Advances to the next 4-byte boundary relative to stream start.
    pub fn align(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::UnexpectedEof { offset: self.pos })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    read_fixed!(read_u16, u16, 2, read_u16, read_u16);
    read_fixed!(read_i16, i16, 2, read_i16, read_i16);
    read_fixed!(read_u32, u32, 4, read_u32, read_u32);
    read_fixed!(read_i32, i32, 4, read_i32, read_i32);
    read_fixed!(read_u64, u64, 8, read_u64, read_u64);
    read_fixed!(read_i64, i64, 8, read_i64, read_i64);
    read_fixed!(read_f32, f32, 4, read_f32, read_f32);
    read_fixed!(read_f64, f64, 8, read_f64, read_f64);

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Length-prefixed UTF-8 string followed by padding to the next 4-byte
    /// boundary.
    pub fn read_aligned_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(Error::UnexpectedEof { offset: self.pos });
        }
        let bytes = self.take(len)?;
        let s = String::from_utf8_lossy(bytes).into_owned();
        self.align();
        Ok(s)
    }

    /// NUL-terminated string; the terminator is consumed.
    pub fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::UnexpectedEof { offset: self.pos })?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }
}

/// A [`ByteCursor`] scoped to one object's byte range.
///
/// Created on demand by [`SerializedFile::reader_for`]; cheap and
/// re-creatable at any time from the object table. Carries the originating
/// container (for version gates and cross-reference widths) and the object's
/// resolved [`TypeTree`], when one is present. Holds mutable position state
/// and must not be shared across threads.
#[derive(Debug)]
pub struct ObjectReader<'a> {
    cursor: ByteCursor<'a>,
    file: &'a SerializedFile,
    info: &'a ObjectInfo,
    tree: Option<&'a TypeTree>,
    start: usize,
    end: usize,
}

impl<'a> ObjectReader<'a> {
    pub(crate) fn new(
        file: &'a SerializedFile,
        info: &'a ObjectInfo,
        tree: Option<&'a TypeTree>,
        data: &'a [u8],
        start: usize,
        endian: Endian,
    ) -> Self {
        let mut cursor = ByteCursor::new(data, endian);
        cursor.set_position(start);
        Self {
            cursor,
            file,
            info,
            tree,
            start,
            end: start + info.byte_size as usize,
        }
    }

    pub fn file(&self) -> &'a SerializedFile {
        self.file
    }

    pub fn info(&self) -> &'a ObjectInfo {
        self.info
    }

    pub fn path_id(&self) -> i64 {
        self.info.path_id
    }

    pub fn class_id(&self) -> ClassId {
        self.info.class_id
    }

    pub fn type_tree(&self) -> Option<&'a TypeTree> {
        self.tree
    }

    /// Position relative to the start of the object's byte range.
    pub fn position_in_object(&self) -> usize {
        self.cursor.position() - self.start
    }

    pub fn object_len(&self) -> usize {
        self.end - self.start
    }

    pub fn remaining_in_object(&self) -> usize {
        self.end.saturating_sub(self.cursor.position())
    }

    /// An indirect object reference: file index plus identity. The identity
    /// width follows the container's format version.
    pub fn read_cross_ref(&mut self) -> Result<CrossRef> {
        let file_index = self.cursor.read_i32()?;
        let path_id = if self.file.big_ids() {
            self.cursor.read_i64()?
        } else {
            self.cursor.read_i32()? as i64
        };
        Ok(CrossRef {
            file_index,
            path_id,
        })
    }
}

impl<'a> std::ops::Deref for ObjectReader<'a> {
    type Target = ByteCursor<'a>;
    fn deref(&self) -> &Self::Target {
        &self.cursor
    }
}

impl std::ops::DerefMut for ObjectReader<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cursor
    }
}
