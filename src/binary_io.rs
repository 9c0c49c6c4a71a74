// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endian-aware cursors over byte buffers.
//!
//! Mach-O images and code signing blobs interleave little- and big-endian
//! structures in the same file, and per-architecture sub-images of universal
//! binaries address their content as if they started at offset 0. The cursors
//! here carry the endianness and the *archive offset* (the sub-image's base in
//! the outer file) so parsing and serialization code can be written entirely
//! in image-relative positions.
//!
//! The write cursor owns a single growable arena. Length and offset fields
//! whose values aren't known until later content has been written are
//! *deferred*: a placeholder is reserved and its index recorded, then
//! committed by seeking back once the value is known. Every structure
//! boundary is checked with [ReadCursor::verify_position] /
//! [WriteCursor::verify_position]; a mismatch is a hard error because silent
//! corruption must never reach a signed binary.

use {
    crate::error::SigningError,
    scroll::{Pread, Pwrite},
};

/// Width of a deferred numeric field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldWidth {
    U32,
    U64,
}

impl FieldWidth {
    fn size(&self) -> u64 {
        match self {
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

/// Handle for a reserved length or offset field in a [WriteCursor].
///
/// Created by [WriteCursor::defer_field] and resolved by
/// [WriteCursor::commit_length] or [WriteCursor::commit_value].
#[derive(Clone, Copy, Debug)]
pub struct DeferredField {
    /// Image-relative index of the reserved placeholder.
    index: u64,
    /// Position lengths/offsets are measured from.
    anchor: u64,
    width: FieldWidth,
}

/// Sequential reader over a byte slice.
pub struct ReadCursor<'a> {
    data: &'a [u8],
    endian: scroll::Endian,
    archive_offset: u64,
    position: u64,
    saved: Vec<u64>,
}

impl<'a> ReadCursor<'a> {
    pub fn new(data: &'a [u8], endian: scroll::Endian) -> Self {
        Self::new_at(data, 0, endian)
    }

    /// Open a cursor whose position 0 maps to `archive_offset` in `data`.
    pub fn new_at(data: &'a [u8], archive_offset: u64, endian: scroll::Endian) -> Self {
        Self {
            data,
            endian,
            archive_offset,
            position: 0,
            saved: vec![],
        }
    }

    pub fn endian(&self) -> scroll::Endian {
        self.endian
    }

    /// Endianness is a property of the container being parsed, not of the
    /// cursor's construction site, so it can be changed mid-stream (the fat
    /// header is big-endian regardless of the inner images).
    pub fn set_endian(&mut self, endian: scroll::Endian) {
        self.endian = endian;
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    pub fn push_position(&mut self) {
        self.saved.push(self.position);
    }

    /// Save the current position and jump to `position`.
    pub fn push_position_and_jump(&mut self, position: u64) {
        self.push_position();
        self.position = position;
    }

    pub fn pop_position(&mut self) -> Result<(), SigningError> {
        self.position = self.saved.pop().ok_or(SigningError::PositionStackEmpty)?;
        Ok(())
    }

    fn absolute(&self) -> usize {
        (self.archive_offset + self.position) as usize
    }

    pub fn read_u8(&mut self) -> Result<u8, SigningError> {
        let v = self.data.pread_with::<u8>(self.absolute(), self.endian)?;
        self.position += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, SigningError> {
        let v = self.data.pread_with::<u16>(self.absolute(), self.endian)?;
        self.position += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32, SigningError> {
        let v = self.data.pread_with::<u32>(self.absolute(), self.endian)?;
        self.position += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64, SigningError> {
        let v = self.data.pread_with::<u64>(self.absolute(), self.endian)?;
        self.position += 8;
        Ok(v)
    }

    /// Read a word whose width depends on the image's address size.
    pub fn read_word(&mut self, wide: bool) -> Result<u64, SigningError> {
        if wide {
            self.read_u64()
        } else {
            Ok(self.read_u32()? as u64)
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], SigningError> {
        let start = self.absolute();
        let end = start
            .checked_add(count)
            .ok_or(SigningError::InputTruncated("byte run"))?;
        if end > self.data.len() {
            return Err(SigningError::InputTruncated("byte run"));
        }
        self.position += count as u64;
        Ok(&self.data[start..end])
    }

    /// Read a fixed-size field holding a NUL-padded ASCII string.
    pub fn read_fixed_string(&mut self, width: usize) -> Result<String, SigningError> {
        let raw = self.read_bytes(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Hard error if the cursor is not where a structure's declared size says
    /// it should be.
    pub fn verify_position(&self, expected: u64) -> Result<(), SigningError> {
        if self.position == expected {
            Ok(())
        } else {
            Err(SigningError::StreamPosition {
                expected,
                actual: self.position,
            })
        }
    }
}

/// Sequential writer over an owned, growable arena.
pub struct WriteCursor {
    buffer: Vec<u8>,
    endian: scroll::Endian,
    archive_offset: u64,
    position: u64,
    saved: Vec<u64>,
}

impl WriteCursor {
    pub fn new(endian: scroll::Endian) -> Self {
        Self::with_buffer(Vec::new(), 0, endian)
    }

    /// Wrap an existing buffer, addressing it relative to `archive_offset`.
    /// Writes past the end grow the arena; writes within it patch in place.
    pub fn with_buffer(buffer: Vec<u8>, archive_offset: u64, endian: scroll::Endian) -> Self {
        Self {
            buffer,
            endian,
            archive_offset,
            position: 0,
            saved: vec![],
        }
    }

    pub fn endian(&self) -> scroll::Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: scroll::Endian) {
        self.endian = endian;
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    pub fn set_archive_offset(&mut self, archive_offset: u64) {
        self.archive_offset = archive_offset;
    }

    pub fn push_position(&mut self) {
        self.saved.push(self.position);
    }

    pub fn push_position_and_jump(&mut self, position: u64) {
        self.push_position();
        self.position = position;
    }

    pub fn pop_position(&mut self) -> Result<(), SigningError> {
        self.position = self.saved.pop().ok_or(SigningError::PositionStackEmpty)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    fn absolute(&self) -> usize {
        (self.archive_offset + self.position) as usize
    }

    fn ensure_len(&mut self, len: usize) {
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), SigningError> {
        let idx = self.absolute();
        self.ensure_len(idx + 1);
        self.buffer.pwrite_with(value, idx, self.endian)?;
        self.position += 1;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), SigningError> {
        let idx = self.absolute();
        self.ensure_len(idx + 2);
        self.buffer.pwrite_with(value, idx, self.endian)?;
        self.position += 2;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), SigningError> {
        let idx = self.absolute();
        self.ensure_len(idx + 4);
        self.buffer.pwrite_with(value, idx, self.endian)?;
        self.position += 4;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), SigningError> {
        let idx = self.absolute();
        self.ensure_len(idx + 8);
        self.buffer.pwrite_with(value, idx, self.endian)?;
        self.position += 8;
        Ok(())
    }

    pub fn write_word(&mut self, value: u64, wide: bool) -> Result<(), SigningError> {
        if wide {
            self.write_u64(value)
        } else {
            self.write_u32(value as u32)
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), SigningError> {
        let idx = self.absolute();
        self.ensure_len(idx + data.len());
        self.buffer[idx..idx + data.len()].copy_from_slice(data);
        self.position += data.len() as u64;
        Ok(())
    }

    pub fn write_zeros(&mut self, count: usize) -> Result<(), SigningError> {
        let idx = self.absolute();
        self.ensure_len(idx + count);
        for b in &mut self.buffer[idx..idx + count] {
            *b = 0;
        }
        self.position += count as u64;
        Ok(())
    }

    /// Write a string into a fixed-size NUL-padded field.
    pub fn write_fixed_string(&mut self, value: &str, width: usize) -> Result<(), SigningError> {
        if value.len() > width {
            return Err(SigningError::InvalidBinary("fixed string too long"));
        }
        self.write_bytes(value.as_bytes())?;
        self.write_zeros(width - value.len())
    }

    /// Zero-fill up to the next multiple of `alignment`.
    pub fn align_to(&mut self, alignment: u64) -> Result<(), SigningError> {
        let rem = self.position % alignment;
        if rem != 0 {
            self.write_zeros((alignment - rem) as usize)?;
        }
        Ok(())
    }

    /// Reserve a length/offset field measured from `anchor`, to be committed
    /// once the true value is known.
    pub fn defer_field(&mut self, anchor: u64, width: FieldWidth) -> Result<DeferredField, SigningError> {
        let field = DeferredField {
            index: self.position,
            anchor,
            width,
        };
        self.write_zeros(width.size() as usize)?;
        Ok(field)
    }

    /// Commit `current position - anchor` into a reserved field.
    pub fn commit_length(&mut self, field: DeferredField) -> Result<(), SigningError> {
        let value = self.position - field.anchor;
        self.commit_value(field, value)
    }

    /// Commit an explicit value into a reserved field.
    pub fn commit_value(&mut self, field: DeferredField, value: u64) -> Result<(), SigningError> {
        self.push_position_and_jump(field.index);
        match field.width {
            FieldWidth::U32 => self.write_u32(value as u32)?,
            FieldWidth::U64 => self.write_u64(value)?,
        }
        self.pop_position()
    }

    pub fn verify_position(&self, expected: u64) -> Result<(), SigningError> {
        if self.position == expected {
            Ok(())
        } else {
            Err(SigningError::StreamPosition {
                expected,
                actual: self.position,
            })
        }
    }

    /// Grow the arena with zeros so the image covers at least `len`
    /// image-relative bytes. Never moves the cursor or shrinks the buffer.
    pub fn ensure_size(&mut self, len: u64) {
        self.ensure_len((self.archive_offset + len) as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_primitives_and_positions() {
        let data = hex::decode("feedfacf00000010cafebabe").unwrap();

        let mut cursor = ReadCursor::new(&data, scroll::BE);
        assert_eq!(cursor.read_u32().unwrap(), 0xfeedfacf);
        assert_eq!(cursor.read_u32().unwrap(), 0x10);

        cursor.push_position_and_jump(0);
        cursor.set_endian(scroll::LE);
        assert_eq!(cursor.read_u32().unwrap(), 0xcffaedfe);
        cursor.pop_position().unwrap();
        cursor.set_endian(scroll::BE);
        assert_eq!(cursor.read_u32().unwrap(), 0xcafebabe);

        assert!(cursor.verify_position(12).is_ok());
        assert!(matches!(
            cursor.verify_position(8),
            Err(SigningError::StreamPosition {
                expected: 8,
                actual: 12
            })
        ));
    }

    #[test]
    fn archive_offset_reads_zero_based() {
        let mut data = vec![0xff; 16];
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let mut cursor = ReadCursor::new_at(&data, 16, scroll::BE);
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.read_u32().unwrap(), 0xdeadbeef);
    }

    #[test]
    fn truncated_read_is_an_error() {
        let data = [0u8; 3];
        let mut cursor = ReadCursor::new(&data, scroll::BE);
        assert!(cursor.read_u32().is_err());
        assert!(matches!(
            ReadCursor::new(&data, scroll::BE).read_bytes(4),
            Err(SigningError::InputTruncated(_))
        ));
    }

    #[test]
    fn deferred_length_commit() {
        let mut cursor = WriteCursor::new(scroll::BE);
        cursor.write_u32(0xfade0cc0).unwrap();
        let anchor = cursor.position() - 4;
        let length = cursor.defer_field(anchor, FieldWidth::U32).unwrap();
        cursor.write_bytes(&[1, 2, 3, 4]).unwrap();
        cursor.commit_length(length).unwrap();

        assert_eq!(cursor.into_inner(), hex::decode("fade0cc00000000c01020304").unwrap());
    }

    #[test]
    fn deferred_offset_commit() {
        let mut cursor = WriteCursor::new(scroll::BE);
        let offset = cursor.defer_field(0, FieldWidth::U32).unwrap();
        cursor.write_zeros(4).unwrap();
        let target = cursor.position();
        cursor.write_u8(0xaa).unwrap();
        cursor.commit_value(offset, target).unwrap();

        assert_eq!(cursor.into_inner(), hex::decode("0000000800000000aa").unwrap());
    }

    #[test]
    fn in_place_patch_does_not_grow_buffer() {
        let mut cursor = WriteCursor::with_buffer(vec![0u8; 8], 0, scroll::LE);
        cursor.push_position_and_jump(4);
        cursor.write_u32(0x11223344).unwrap();
        cursor.pop_position().unwrap();

        let buffer = cursor.into_inner();
        assert_eq!(buffer.len(), 8);
        assert_eq!(&buffer[4..], &[0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn fixed_string_round_trip() {
        let mut cursor = WriteCursor::new(scroll::LE);
        cursor.write_fixed_string("__LINKEDIT", 16).unwrap();
        let data = cursor.into_inner();
        assert_eq!(data.len(), 16);

        let mut cursor = ReadCursor::new(&data, scroll::LE);
        assert_eq!(cursor.read_fixed_string(16).unwrap(), "__LINKEDIT");
    }
}
