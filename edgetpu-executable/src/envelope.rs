// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The custom-op initializer buffer is a FlexBuffer map. Only the subset
//! the compiler emits is understood: a root map whose values are inline
//! integers, strings or blobs.

use alloc::vec::Vec;

// FlexBuffer type codes.
const FBT_INT: u8 = 1;
const FBT_UINT: u8 = 2;
const FBT_STRING: u8 = 5;
const FBT_MAP: u8 = 9;
const FBT_BLOB: u8 = 25;

/// Format version of the envelope.
pub const VERSION_KEY: &str = "1";
/// Name of the chip the package was compiled for.
pub const CHIP_KEY: &str = "2";
/// Serialized Package flatbuffer.
pub const EXECUTABLE_KEY: &str = "4";

fn is_valid_width(width: usize) -> bool { matches!(width, 1 | 2 | 4 | 8) }

fn read_uint(buf: &[u8], pos: usize, width: usize) -> Option<u64> {
    let bytes = buf.get(pos..pos.checked_add(width)?)?;
    let mut value = [0u8; 8];
    value[..width].copy_from_slice(bytes);
    Some(u64::from_le_bytes(value))
}

fn read_int(buf: &[u8], pos: usize, width: usize) -> Option<i64> {
    let shift = 64 - 8 * width as u32;
    Some(((read_uint(buf, pos, width)? << shift) as i64) >> shift)
}

// Offsets are unsigned and point backwards from the field holding them.
fn indirect(buf: &[u8], pos: usize, width: usize) -> Option<usize> {
    let offset = usize::try_from(read_uint(buf, pos, width)?).ok()?;
    pos.checked_sub(offset)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlexValue<'a> {
    Int(i64),
    UInt(u64),
    // Strings are not required to be UTF-8 here; the compiler stores
    // binary payloads under string keys as well.
    String(&'a [u8]),
    Blob(&'a [u8]),
    Other(u8),
}
impl<'a> FlexValue<'a> {
    /// Payload bytes of a string or blob.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            FlexValue::String(bytes) | FlexValue::Blob(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// A map at the root of a FlexBuffer.
pub struct FlexMap<'a> {
    buf: &'a [u8],
    pos: usize,
    width: usize,
    len: usize,
    keys_pos: usize,
    keys_width: usize,
}
impl<'a> FlexMap<'a> {
    pub fn root(buf: &'a [u8]) -> Option<FlexMap<'a>> {
        if buf.len() < 3 {
            return None;
        }
        let root_width = buf[buf.len() - 1] as usize;
        let packed_type = buf[buf.len() - 2];
        if !is_valid_width(root_width) || packed_type >> 2 != FBT_MAP {
            return None;
        }
        let root_pos = buf.len().checked_sub(2 + root_width)?;
        let pos = indirect(buf, root_pos, root_width)?;
        FlexMap::at(buf, pos, 1 << (packed_type & 3))
    }

    fn at(buf: &'a [u8], pos: usize, width: usize) -> Option<FlexMap<'a>> {
        let len = usize::try_from(read_uint(buf, pos.checked_sub(width)?, width)?).ok()?;
        let keys_width =
            usize::try_from(read_uint(buf, pos.checked_sub(2 * width)?, width)?).ok()?;
        let keys_pos = indirect(buf, pos.checked_sub(3 * width)?, width)?;
        // Values are followed by one packed type byte per value.
        let end = pos.checked_add(len.checked_mul(width + 1)?)?;
        if end > buf.len() || !is_valid_width(keys_width) {
            return None;
        }
        Some(FlexMap {
            buf,
            pos,
            width,
            len,
            keys_pos,
            keys_width,
        })
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn key(&self, index: usize) -> Option<&'a str> {
        let field = self.keys_pos.checked_add(index.checked_mul(self.keys_width)?)?;
        let start = indirect(self.buf, field, self.keys_width)?;
        let rest = self.buf.get(start..)?;
        let end = rest.iter().position(|b| *b == 0)?;
        core::str::from_utf8(&rest[..end]).ok()
    }

    pub fn value(&self, index: usize) -> Option<FlexValue<'a>> {
        if index >= self.len {
            return None;
        }
        let packed_type = *self.buf.get(self.pos + self.len * self.width + index)?;
        let field = self.pos + index * self.width;
        match packed_type >> 2 {
            FBT_INT => Some(FlexValue::Int(read_int(self.buf, field, self.width)?)),
            FBT_UINT => Some(FlexValue::UInt(read_uint(self.buf, field, self.width)?)),
            kind @ (FBT_STRING | FBT_BLOB) => {
                // The size prefix has the width of the child, not the map.
                let child_width = 1 << (packed_type & 3);
                let start = indirect(self.buf, field, self.width)?;
                let size = read_uint(self.buf, start.checked_sub(child_width)?, child_width)?;
                let size = usize::try_from(size).ok()?;
                let bytes = self.buf.get(start..start.checked_add(size)?)?;
                if kind == FBT_STRING {
                    Some(FlexValue::String(bytes))
                } else {
                    Some(FlexValue::Blob(bytes))
                }
            }
            other => Some(FlexValue::Other(other)),
        }
    }

    pub fn get(&self, key: &str) -> Option<FlexValue<'a>> {
        (0..self.len)
            .find(|i| self.key(*i) == Some(key))
            .and_then(|i| self.value(i))
    }
}

#[derive(Clone, Copy, Debug)]
pub enum EnvelopeEntry<'a> {
    UInt(u32),
    String(&'a str),
    Blob(&'a [u8]),
}

fn align(buf: &mut Vec<u8>, alignment: usize) {
    while buf.len() % alignment != 0 {
        buf.push(0);
    }
}

fn push_u32(buf: &mut Vec<u8>, value: usize) {
    buf.extend_from_slice(&(value as u32).to_le_bytes());
}

/// Serializes |entries| as a root FlexBuffer map with 32-bit fields.
pub fn encode_envelope(entries: &[(&str, EnvelopeEntry)]) -> Vec<u8> {
    const WIDTH: usize = 4;
    const WIDTH_BITS: u8 = 2;

    let mut entries: Vec<&(&str, EnvelopeEntry)> = entries.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut buf = Vec::new();
    let key_positions: Vec<usize> = entries
        .iter()
        .map(|(key, _)| {
            let pos = buf.len();
            buf.extend_from_slice(key.as_bytes());
            buf.push(0);
            pos
        })
        .collect();

    let value_positions: Vec<usize> = entries
        .iter()
        .map(|(_, entry)| {
            let (bytes, terminated) = match entry {
                EnvelopeEntry::UInt(_) => return 0,
                EnvelopeEntry::String(s) => (s.as_bytes(), true),
                EnvelopeEntry::Blob(b) => (*b, false),
            };
            align(&mut buf, WIDTH);
            push_u32(&mut buf, bytes.len());
            let pos = buf.len();
            buf.extend_from_slice(bytes);
            if terminated {
                buf.push(0);
            }
            pos
        })
        .collect();

    align(&mut buf, WIDTH);
    push_u32(&mut buf, entries.len());
    let keys_pos = buf.len();
    for key_pos in &key_positions {
        let field = buf.len();
        push_u32(&mut buf, field - key_pos);
    }

    let field = buf.len();
    push_u32(&mut buf, field - keys_pos);
    push_u32(&mut buf, WIDTH);
    push_u32(&mut buf, entries.len());
    let map_pos = buf.len();
    for ((_, entry), value_pos) in entries.iter().zip(&value_positions) {
        let field = buf.len();
        match entry {
            EnvelopeEntry::UInt(v) => push_u32(&mut buf, *v as usize),
            _ => push_u32(&mut buf, field - value_pos),
        }
    }
    for (_, entry) in &entries {
        let kind = match entry {
            EnvelopeEntry::UInt(_) => FBT_UINT,
            EnvelopeEntry::String(_) => FBT_STRING,
            EnvelopeEntry::Blob(_) => FBT_BLOB,
        };
        buf.push(kind << 2 | WIDTH_BITS);
    }

    let field = buf.len();
    push_u32(&mut buf, field - map_pos);
    buf.push(FBT_MAP << 2 | WIDTH_BITS);
    buf.push(WIDTH as u8);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        encode_envelope(&[
            (EXECUTABLE_KEY, EnvelopeEntry::Blob(&[0xde, 0xad, 0xbe, 0xef])),
            (VERSION_KEY, EnvelopeEntry::UInt(1)),
            (CHIP_KEY, EnvelopeEntry::String("beagle")),
        ])
    }

    #[test]
    fn lookup_by_key() {
        let buf = sample();
        let map = FlexMap::root(&buf).unwrap();
        assert_eq!(map.len(), 3);
        // Keys are stored sorted.
        assert_eq!(map.key(0), Some(VERSION_KEY));
        assert_eq!(map.key(2), Some(EXECUTABLE_KEY));
        assert_eq!(map.get(VERSION_KEY), Some(FlexValue::UInt(1)));
        assert_eq!(map.get(CHIP_KEY), Some(FlexValue::String(b"beagle")));
        assert_eq!(
            map.get(EXECUTABLE_KEY).and_then(|v| v.as_bytes()),
            Some(&[0xde, 0xad, 0xbe, 0xef][..])
        );
        assert_eq!(map.get("3"), None);
    }

    #[test]
    fn narrow_map_with_signed_value() {
        // Hand-assembled map {"a": -2} using 8-bit fields.
        let buf = [
            b'a', 0, // key
            1, 3, // keys vector: len 1, offset back to "a"
            1, 1, 1, // keys offset, keys width, map len
            0xfe, // value
            FBT_INT << 2, // packed type
            2, FBT_MAP << 2, 1, // root offset, root type, root width
        ];
        let map = FlexMap::root(&buf).unwrap();
        assert_eq!(map.get("a"), Some(FlexValue::Int(-2)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(FlexMap::root(&[]).is_none());
        assert!(FlexMap::root(&[0, 0, 0]).is_none());
        let mut buf = sample();
        // Not a map at the root.
        let n = buf.len();
        buf[n - 2] = FBT_BLOB << 2 | 2;
        assert!(FlexMap::root(&buf).is_none());
        // Truncated.
        let buf = sample();
        assert!(FlexMap::root(&buf[buf.len() - 8..]).is_none());
    }
}
