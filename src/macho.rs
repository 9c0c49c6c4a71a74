// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O object model.
//!
//! Parses the header and ordered load command list of a Mach-O image into a
//! closed set of command variants, and serializes the model back out. The
//! goal is lossless round-tripping of unsigned stub executables, not general
//! linking: commands are never added, removed, or relocated. Every parsed
//! command records its starting file offset so individual fields can later be
//! patched in place without rewriting the file.

use {
    crate::{
        binary_io::{FieldWidth, ReadCursor, WriteCursor},
        error::SigningError,
    },
    log::debug,
};

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;

/// High bit marking commands the dynamic loader must understand. Masked off
/// when dispatching to a variant, preserved in the serialized command code.
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

pub const LC_SEGMENT: u32 = 0x01;
pub const LC_SYMTAB: u32 = 0x02;
pub const LC_UNIXTHREAD: u32 = 0x05;
pub const LC_DYSYMTAB: u32 = 0x0b;
pub const LC_LOAD_DYLIB: u32 = 0x0c;
pub const LC_ID_DYLIB: u32 = 0x0d;
pub const LC_LOAD_DYLINKER: u32 = 0x0e;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;

pub const SEG_LINKEDIT: &str = "__LINKEDIT";

/// Mask selecting a section's type from its flags.
const SECTION_TYPE_MASK: u32 = 0xff;
const S_ZEROFILL: u32 = 0x01;
const S_GB_ZEROFILL: u32 = 0x0c;

/// Unsigned stub executables reserve this much space for the header and load
/// commands; serialized commands are zero-padded up to it so section data
/// offsets recorded by the original build remain valid.
pub const HEADER_PAD: u64 = 0x1a60;

/// Whether the image uses 32- or 64-bit addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSize {
    Bits32,
    Bits64,
}

impl AddressSize {
    pub fn is_64(&self) -> bool {
        matches!(self, Self::Bits64)
    }

    /// Width in bytes of an address-sized field.
    pub fn word_size(&self) -> u64 {
        if self.is_64() {
            8
        } else {
            4
        }
    }
}

/// A section within a segment.
#[derive(Clone, Debug)]
pub struct Section {
    pub section_name: String,
    pub segment_name: String,
    pub address: u64,
    pub size: u64,
    pub file_offset: u32,
    pub align: u32,
    pub relocations_offset: u32,
    pub relocations_count: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
    /// Raw content read from `file_offset`. Absent for zero-fill sections.
    pub data: Option<Vec<u8>>,
}

impl Section {
    pub fn is_zero_fill(&self) -> bool {
        matches!(self.flags & SECTION_TYPE_MASK, S_ZEROFILL | S_GB_ZEROFILL)
    }

    fn parse(cursor: &mut ReadCursor, address_size: AddressSize) -> Result<Self, SigningError> {
        let section_name = cursor.read_fixed_string(16)?;
        let segment_name = cursor.read_fixed_string(16)?;
        let address = cursor.read_word(address_size.is_64())?;
        let size = cursor.read_word(address_size.is_64())?;
        let file_offset = cursor.read_u32()?;
        let align = cursor.read_u32()?;
        let relocations_offset = cursor.read_u32()?;
        let relocations_count = cursor.read_u32()?;
        let flags = cursor.read_u32()?;
        let reserved1 = cursor.read_u32()?;
        let reserved2 = cursor.read_u32()?;
        let reserved3 = if address_size.is_64() {
            cursor.read_u32()?
        } else {
            0
        };

        Ok(Self {
            section_name,
            segment_name,
            address,
            size,
            file_offset,
            align,
            relocations_offset,
            relocations_count,
            flags,
            reserved1,
            reserved2,
            reserved3,
            data: None,
        })
    }

    /// Fill [Section::data] from the recorded file offset.
    fn read_content(&mut self, cursor: &mut ReadCursor) -> Result<(), SigningError> {
        if self.is_zero_fill() || self.size == 0 || self.file_offset == 0 {
            return Ok(());
        }

        cursor.push_position_and_jump(self.file_offset as u64);
        self.data = Some(cursor.read_bytes(self.size as usize)?.to_vec());
        cursor.pop_position()
    }

    fn write(&self, cursor: &mut WriteCursor, address_size: AddressSize) -> Result<(), SigningError> {
        cursor.write_fixed_string(&self.section_name, 16)?;
        cursor.write_fixed_string(&self.segment_name, 16)?;
        cursor.write_word(self.address, address_size.is_64())?;
        cursor.write_word(self.size, address_size.is_64())?;
        cursor.write_u32(self.file_offset)?;
        cursor.write_u32(self.align)?;
        cursor.write_u32(self.relocations_offset)?;
        cursor.write_u32(self.relocations_count)?;
        cursor.write_u32(self.flags)?;
        cursor.write_u32(self.reserved1)?;
        cursor.write_u32(self.reserved2)?;
        if address_size.is_64() {
            cursor.write_u32(self.reserved3)?;
        }

        Ok(())
    }
}

/// `LC_SEGMENT` / `LC_SEGMENT_64`.
#[derive(Clone, Debug)]
pub struct SegmentCommand {
    pub command: u32,
    pub command_offset: u64,
    pub address_size: AddressSize,
    pub name: String,
    pub vm_address: u64,
    pub vm_size: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub max_protection: u32,
    pub initial_protection: u32,
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl SegmentCommand {
    /// File offset one past the last byte this segment occupies.
    pub fn file_end(&self) -> u64 {
        self.file_offset + self.file_size
    }

    fn parse(
        cursor: &mut ReadCursor,
        command: u32,
        command_offset: u64,
        address_size: AddressSize,
    ) -> Result<Self, SigningError> {
        let name = cursor.read_fixed_string(16)?;
        let vm_address = cursor.read_word(address_size.is_64())?;
        let vm_size = cursor.read_word(address_size.is_64())?;
        let file_offset = cursor.read_word(address_size.is_64())?;
        let file_size = cursor.read_word(address_size.is_64())?;
        let max_protection = cursor.read_u32()?;
        let initial_protection = cursor.read_u32()?;
        let section_count = cursor.read_u32()?;
        let flags = cursor.read_u32()?;

        let mut sections = Vec::with_capacity(section_count as usize);
        for _ in 0..section_count {
            sections.push(Section::parse(cursor, address_size)?);
        }

        Ok(Self {
            command,
            command_offset,
            address_size,
            name,
            vm_address,
            vm_size,
            file_offset,
            file_size,
            max_protection,
            initial_protection,
            flags,
            sections,
        })
    }

    fn write_payload(&self, cursor: &mut WriteCursor) -> Result<(), SigningError> {
        cursor.write_fixed_string(&self.name, 16)?;
        cursor.write_word(self.vm_address, self.address_size.is_64())?;
        cursor.write_word(self.vm_size, self.address_size.is_64())?;
        cursor.write_word(self.file_offset, self.address_size.is_64())?;
        cursor.write_word(self.file_size, self.address_size.is_64())?;
        cursor.write_u32(self.max_protection)?;
        cursor.write_u32(self.initial_protection)?;
        cursor.write_u32(self.sections.len() as u32)?;
        cursor.write_u32(self.flags)?;

        for section in &self.sections {
            section.write(cursor, self.address_size)?;
        }

        Ok(())
    }

    /// Rewrite this command's file size field in place. The cursor must carry
    /// the image's endianness and archive offset.
    pub fn patch_file_size(&self, cursor: &mut WriteCursor, new_size: u64) -> Result<(), SigningError> {
        // cmd + cmdsize + name, then vmaddr, vmsize, fileoff precede filesize.
        let field = self.command_offset + 8 + 16 + 3 * self.address_size.word_size();
        cursor.push_position_and_jump(field);
        cursor.write_word(new_size, self.address_size.is_64())?;
        cursor.pop_position()
    }
}

/// `LC_SYMTAB`.
#[derive(Clone, Debug)]
pub struct SymbolTableCommand {
    pub command: u32,
    pub command_offset: u64,
    pub symbols_offset: u32,
    pub symbol_count: u32,
    pub strings_offset: u32,
    pub strings_size: u32,
}

/// `LC_DYSYMTAB`.
#[derive(Clone, Debug)]
pub struct DynamicSymbolTableCommand {
    pub command: u32,
    pub command_offset: u64,
    pub local_symbols_index: u32,
    pub local_symbols_count: u32,
    pub external_symbols_index: u32,
    pub external_symbols_count: u32,
    pub undefined_symbols_index: u32,
    pub undefined_symbols_count: u32,
    pub toc_offset: u32,
    pub toc_count: u32,
    pub module_table_offset: u32,
    pub module_table_count: u32,
    pub referenced_symbols_offset: u32,
    pub referenced_symbols_count: u32,
    pub indirect_symbols_offset: u32,
    pub indirect_symbols_count: u32,
    pub external_relocations_offset: u32,
    pub external_relocations_count: u32,
    pub local_relocations_offset: u32,
    pub local_relocations_count: u32,
}

/// `LC_LOAD_DYLIB` / `LC_ID_DYLIB` / `LC_LOAD_WEAK_DYLIB`.
#[derive(Clone, Debug)]
pub struct DylibCommand {
    pub command: u32,
    pub command_offset: u64,
    pub name_offset: u32,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
    pub name: String,
    /// Original command size; the path's NUL padding is reproduced exactly.
    pub padded_size: u32,
}

/// `LC_LOAD_DYLINKER`.
#[derive(Clone, Debug)]
pub struct DylinkerCommand {
    pub command: u32,
    pub command_offset: u64,
    pub name_offset: u32,
    pub name: String,
    pub padded_size: u32,
}

/// `LC_UUID`.
#[derive(Clone, Debug)]
pub struct UuidCommand {
    pub command: u32,
    pub command_offset: u64,
    pub uuid: [u8; 16],
}

/// `LC_CODE_SIGNATURE`: file offset and size of the embedded signature blob.
#[derive(Clone, Debug)]
pub struct CodeSignatureCommand {
    pub command: u32,
    pub command_offset: u64,
    pub data_offset: u32,
    pub data_size: u32,
}

impl CodeSignatureCommand {
    /// File offset one past the reserved signature region.
    pub fn data_end(&self) -> u64 {
        self.data_offset as u64 + self.data_size as u64
    }

    /// Rewrite the blob offset/size fields in place. The cursor must carry
    /// the image's endianness and archive offset.
    pub fn patch_region(
        &self,
        cursor: &mut WriteCursor,
        data_offset: u32,
        data_size: u32,
    ) -> Result<(), SigningError> {
        cursor.push_position_and_jump(self.command_offset + 8);
        cursor.write_u32(data_offset)?;
        cursor.write_u32(data_size)?;
        cursor.pop_position()
    }
}

/// `LC_ENCRYPTION_INFO` / `LC_ENCRYPTION_INFO_64`.
#[derive(Clone, Debug)]
pub struct EncryptionInfoCommand {
    pub command: u32,
    pub command_offset: u64,
    pub crypt_offset: u32,
    pub crypt_size: u32,
    pub crypt_id: u32,
    /// Alignment padding carried by the 64-bit form.
    pub pad: Option<u32>,
}

/// `LC_DYLD_INFO` (with or without the dyld-required bit).
#[derive(Clone, Debug)]
pub struct DyldInfoCommand {
    pub command: u32,
    pub command_offset: u64,
    pub rebase_offset: u32,
    pub rebase_size: u32,
    pub bind_offset: u32,
    pub bind_size: u32,
    pub weak_bind_offset: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_offset: u32,
    pub lazy_bind_size: u32,
    pub export_offset: u32,
    pub export_size: u32,
}

/// Fallback preserving unrecognized commands byte for byte.
#[derive(Clone, Debug)]
pub struct OpaqueCommand {
    pub command: u32,
    pub command_offset: u64,
    pub payload: Vec<u8>,
}

/// A single load command, tagged by its 32-bit code.
#[derive(Clone, Debug)]
pub enum LoadCommand {
    Segment(SegmentCommand),
    SymbolTable(SymbolTableCommand),
    DynamicSymbolTable(DynamicSymbolTableCommand),
    Dylib(DylibCommand),
    DynamicLinkerName(DylinkerCommand),
    Uuid(UuidCommand),
    CodeSignature(CodeSignatureCommand),
    EncryptionInfo(EncryptionInfoCommand),
    DyldInfo(DyldInfoCommand),
    Opaque(OpaqueCommand),
}

impl LoadCommand {
    /// Parse the next command. The cursor is positioned at the command's
    /// `cmd` field.
    fn parse(cursor: &mut ReadCursor, address_size: AddressSize) -> Result<Self, SigningError> {
        let command_offset = cursor.position();
        let command = cursor.read_u32()?;
        let command_size = cursor.read_u32()?;

        if command_size < 8 || command_size % 4 != 0 {
            return Err(SigningError::InvalidBinary(
                "load command size not a positive multiple of 4",
            ));
        }

        let end = command_offset + command_size as u64;

        let parsed = match command & !LC_REQ_DYLD {
            LC_SEGMENT | LC_SEGMENT_64 => Self::Segment(SegmentCommand::parse(
                cursor,
                command,
                command_offset,
                address_size,
            )?),
            LC_SYMTAB => Self::SymbolTable(SymbolTableCommand {
                command,
                command_offset,
                symbols_offset: cursor.read_u32()?,
                symbol_count: cursor.read_u32()?,
                strings_offset: cursor.read_u32()?,
                strings_size: cursor.read_u32()?,
            }),
            LC_DYSYMTAB => Self::DynamicSymbolTable(DynamicSymbolTableCommand {
                command,
                command_offset,
                local_symbols_index: cursor.read_u32()?,
                local_symbols_count: cursor.read_u32()?,
                external_symbols_index: cursor.read_u32()?,
                external_symbols_count: cursor.read_u32()?,
                undefined_symbols_index: cursor.read_u32()?,
                undefined_symbols_count: cursor.read_u32()?,
                toc_offset: cursor.read_u32()?,
                toc_count: cursor.read_u32()?,
                module_table_offset: cursor.read_u32()?,
                module_table_count: cursor.read_u32()?,
                referenced_symbols_offset: cursor.read_u32()?,
                referenced_symbols_count: cursor.read_u32()?,
                indirect_symbols_offset: cursor.read_u32()?,
                indirect_symbols_count: cursor.read_u32()?,
                external_relocations_offset: cursor.read_u32()?,
                external_relocations_count: cursor.read_u32()?,
                local_relocations_offset: cursor.read_u32()?,
                local_relocations_count: cursor.read_u32()?,
            }),
            LC_LOAD_DYLIB | LC_ID_DYLIB | LC_LOAD_WEAK_DYLIB => {
                let name_offset = cursor.read_u32()?;
                let timestamp = cursor.read_u32()?;
                let current_version = cursor.read_u32()?;
                let compatibility_version = cursor.read_u32()?;
                let name = read_padded_string(cursor, end)?;

                Self::Dylib(DylibCommand {
                    command,
                    command_offset,
                    name_offset,
                    timestamp,
                    current_version,
                    compatibility_version,
                    name,
                    padded_size: command_size,
                })
            }
            LC_LOAD_DYLINKER => {
                let name_offset = cursor.read_u32()?;
                let name = read_padded_string(cursor, end)?;

                Self::DynamicLinkerName(DylinkerCommand {
                    command,
                    command_offset,
                    name_offset,
                    name,
                    padded_size: command_size,
                })
            }
            LC_UUID => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(cursor.read_bytes(16)?);
                Self::Uuid(UuidCommand {
                    command,
                    command_offset,
                    uuid,
                })
            }
            LC_CODE_SIGNATURE => Self::CodeSignature(CodeSignatureCommand {
                command,
                command_offset,
                data_offset: cursor.read_u32()?,
                data_size: cursor.read_u32()?,
            }),
            LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => Self::EncryptionInfo(EncryptionInfoCommand {
                command,
                command_offset,
                crypt_offset: cursor.read_u32()?,
                crypt_size: cursor.read_u32()?,
                crypt_id: cursor.read_u32()?,
                pad: if command & !LC_REQ_DYLD == LC_ENCRYPTION_INFO_64 {
                    Some(cursor.read_u32()?)
                } else {
                    None
                },
            }),
            LC_DYLD_INFO => Self::DyldInfo(DyldInfoCommand {
                command,
                command_offset,
                rebase_offset: cursor.read_u32()?,
                rebase_size: cursor.read_u32()?,
                bind_offset: cursor.read_u32()?,
                bind_size: cursor.read_u32()?,
                weak_bind_offset: cursor.read_u32()?,
                weak_bind_size: cursor.read_u32()?,
                lazy_bind_offset: cursor.read_u32()?,
                lazy_bind_size: cursor.read_u32()?,
                export_offset: cursor.read_u32()?,
                export_size: cursor.read_u32()?,
            }),
            other => {
                debug!(
                    "preserving unrecognized load command 0x{:x} ({} bytes) verbatim",
                    other, command_size
                );
                Self::Opaque(OpaqueCommand {
                    command,
                    command_offset,
                    payload: cursor.read_bytes(command_size as usize - 8)?.to_vec(),
                })
            }
        };

        cursor.verify_position(end)?;

        Ok(parsed)
    }

    /// Serialize this command, recording its start offset and verifying the
    /// declared size matches the bytes emitted.
    fn write(&mut self, cursor: &mut WriteCursor) -> Result<(), SigningError> {
        let command_offset = cursor.position();
        *self.command_offset_mut() = command_offset;

        cursor.write_u32(self.command_code())?;
        let size_field = cursor.defer_field(command_offset, FieldWidth::U32)?;

        match self {
            Self::Segment(segment) => segment.write_payload(cursor)?,
            Self::SymbolTable(symtab) => {
                cursor.write_u32(symtab.symbols_offset)?;
                cursor.write_u32(symtab.symbol_count)?;
                cursor.write_u32(symtab.strings_offset)?;
                cursor.write_u32(symtab.strings_size)?;
            }
            Self::DynamicSymbolTable(dysymtab) => {
                for value in [
                    dysymtab.local_symbols_index,
                    dysymtab.local_symbols_count,
                    dysymtab.external_symbols_index,
                    dysymtab.external_symbols_count,
                    dysymtab.undefined_symbols_index,
                    dysymtab.undefined_symbols_count,
                    dysymtab.toc_offset,
                    dysymtab.toc_count,
                    dysymtab.module_table_offset,
                    dysymtab.module_table_count,
                    dysymtab.referenced_symbols_offset,
                    dysymtab.referenced_symbols_count,
                    dysymtab.indirect_symbols_offset,
                    dysymtab.indirect_symbols_count,
                    dysymtab.external_relocations_offset,
                    dysymtab.external_relocations_count,
                    dysymtab.local_relocations_offset,
                    dysymtab.local_relocations_count,
                ] {
                    cursor.write_u32(value)?;
                }
            }
            Self::Dylib(dylib) => {
                cursor.write_u32(dylib.name_offset)?;
                cursor.write_u32(dylib.timestamp)?;
                cursor.write_u32(dylib.current_version)?;
                cursor.write_u32(dylib.compatibility_version)?;
                write_padded_string(cursor, &dylib.name, command_offset + dylib.padded_size as u64)?;
            }
            Self::DynamicLinkerName(dylinker) => {
                cursor.write_u32(dylinker.name_offset)?;
                write_padded_string(
                    cursor,
                    &dylinker.name,
                    command_offset + dylinker.padded_size as u64,
                )?;
            }
            Self::Uuid(uuid) => cursor.write_bytes(&uuid.uuid)?,
            Self::CodeSignature(signature) => {
                cursor.write_u32(signature.data_offset)?;
                cursor.write_u32(signature.data_size)?;
            }
            Self::EncryptionInfo(encryption) => {
                cursor.write_u32(encryption.crypt_offset)?;
                cursor.write_u32(encryption.crypt_size)?;
                cursor.write_u32(encryption.crypt_id)?;
                if let Some(pad) = encryption.pad {
                    cursor.write_u32(pad)?;
                }
            }
            Self::DyldInfo(info) => {
                for value in [
                    info.rebase_offset,
                    info.rebase_size,
                    info.bind_offset,
                    info.bind_size,
                    info.weak_bind_offset,
                    info.weak_bind_size,
                    info.lazy_bind_offset,
                    info.lazy_bind_size,
                    info.export_offset,
                    info.export_size,
                ] {
                    cursor.write_u32(value)?;
                }
            }
            Self::Opaque(opaque) => cursor.write_bytes(&opaque.payload)?,
        }

        cursor.align_to(4)?;
        cursor.commit_length(size_field)?;

        Ok(())
    }

    /// The on-disk command code, including the dyld-required bit if present.
    pub fn command_code(&self) -> u32 {
        match self {
            Self::Segment(c) => c.command,
            Self::SymbolTable(c) => c.command,
            Self::DynamicSymbolTable(c) => c.command,
            Self::Dylib(c) => c.command,
            Self::DynamicLinkerName(c) => c.command,
            Self::Uuid(c) => c.command,
            Self::CodeSignature(c) => c.command,
            Self::EncryptionInfo(c) => c.command,
            Self::DyldInfo(c) => c.command,
            Self::Opaque(c) => c.command,
        }
    }

    fn command_offset_mut(&mut self) -> &mut u64 {
        match self {
            Self::Segment(c) => &mut c.command_offset,
            Self::SymbolTable(c) => &mut c.command_offset,
            Self::DynamicSymbolTable(c) => &mut c.command_offset,
            Self::Dylib(c) => &mut c.command_offset,
            Self::DynamicLinkerName(c) => &mut c.command_offset,
            Self::Uuid(c) => &mut c.command_offset,
            Self::CodeSignature(c) => &mut c.command_offset,
            Self::EncryptionInfo(c) => &mut c.command_offset,
            Self::DyldInfo(c) => &mut c.command_offset,
            Self::Opaque(c) => &mut c.command_offset,
        }
    }
}

/// Read a NUL-terminated string occupying the rest of a command, consuming
/// its padding.
fn read_padded_string(cursor: &mut ReadCursor, end: u64) -> Result<String, SigningError> {
    let remaining = end
        .checked_sub(cursor.position())
        .ok_or(SigningError::InvalidBinary("string extends past command"))?;
    let raw = cursor.read_bytes(remaining as usize)?;
    let terminator = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..terminator]).into_owned())
}

/// Write a string and NUL-pad out to the command's recorded end.
fn write_padded_string(cursor: &mut WriteCursor, value: &str, end: u64) -> Result<(), SigningError> {
    cursor.write_bytes(value.as_bytes())?;
    let remaining = end
        .checked_sub(cursor.position())
        .ok_or(SigningError::InvalidBinary("string exceeds command size"))?;
    cursor.write_zeros(remaining as usize)
}

/// A parsed Mach-O image.
#[derive(Clone, Debug)]
pub struct MachObjectFile {
    pub endian: scroll::Endian,
    pub address_size: AddressSize,
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub file_type: u32,
    pub flags: u32,
    pub reserved: u32,
    pub commands: Vec<LoadCommand>,
}

impl MachObjectFile {
    /// Parse an image. The cursor's archive offset selects the sub-image
    /// within a universal binary; positions inside are image-relative.
    pub fn parse(cursor: &mut ReadCursor) -> Result<Self, SigningError> {
        let raw_magic = u32::from_be_bytes(
            cursor
                .read_bytes(4)?
                .try_into()
                .map_err(|_| SigningError::InputTruncated("mach-o magic"))?,
        );

        let (endian, address_size) = match raw_magic {
            MH_MAGIC => (scroll::BE, AddressSize::Bits32),
            MH_MAGIC_64 => (scroll::BE, AddressSize::Bits64),
            m if m == MH_MAGIC.swap_bytes() => (scroll::LE, AddressSize::Bits32),
            m if m == MH_MAGIC_64.swap_bytes() => (scroll::LE, AddressSize::Bits64),
            _ => return Err(SigningError::BadMagic("mach-o header")),
        };
        cursor.set_endian(endian);

        let cpu_type = cursor.read_u32()?;
        let cpu_subtype = cursor.read_u32()?;
        let file_type = cursor.read_u32()?;
        let command_count = cursor.read_u32()?;
        let commands_size = cursor.read_u32()?;
        let flags = cursor.read_u32()?;
        let reserved = if address_size.is_64() {
            cursor.read_u32()?
        } else {
            0
        };

        let commands_end = cursor.position() + commands_size as u64;

        let mut commands = Vec::with_capacity(command_count as usize);
        for _ in 0..command_count {
            commands.push(LoadCommand::parse(cursor, address_size)?);
        }

        cursor.verify_position(commands_end)?;

        let mut image = Self {
            endian,
            address_size,
            cpu_type,
            cpu_subtype,
            file_type,
            flags,
            reserved,
            commands,
        };

        for command in &mut image.commands {
            if let LoadCommand::Segment(segment) = command {
                for section in &mut segment.sections {
                    section.read_content(cursor)?;
                }
            }
        }

        Ok(image)
    }

    /// Serialize the image: header, commands (recording their offsets), zero
    /// padding up to [HEADER_PAD], then section content at its recorded
    /// offsets. The arena is extended with zeros to cover every segment's
    /// file extent, so reserved regions (like a placeholder signature area)
    /// exist in the output.
    pub fn write(&mut self, cursor: &mut WriteCursor) -> Result<(), SigningError> {
        cursor.set_endian(self.endian);

        let magic = if self.address_size.is_64() {
            MH_MAGIC_64
        } else {
            MH_MAGIC
        };
        cursor.write_u32(magic)?;
        cursor.write_u32(self.cpu_type)?;
        cursor.write_u32(self.cpu_subtype)?;
        cursor.write_u32(self.file_type)?;
        cursor.write_u32(self.commands.len() as u32)?;

        // The size field precedes flags (and the 64-bit reserved word) but
        // measures from where the first command starts.
        let commands_start =
            cursor.position() + 4 + 4 + if self.address_size.is_64() { 4 } else { 0 };
        let size_field = cursor.defer_field(commands_start, FieldWidth::U32)?;
        cursor.write_u32(self.flags)?;
        if self.address_size.is_64() {
            cursor.write_u32(self.reserved)?;
        }

        for command in &mut self.commands {
            command.write(cursor)?;
        }
        cursor.commit_length(size_field)?;

        if cursor.position() < HEADER_PAD {
            let pad = HEADER_PAD - cursor.position();
            cursor.write_zeros(pad as usize)?;
        }

        let mut file_extent = cursor.position();
        for command in &self.commands {
            if let LoadCommand::Segment(segment) = command {
                file_extent = file_extent.max(segment.file_end());
                for section in &segment.sections {
                    if let Some(data) = &section.data {
                        cursor.push_position_and_jump(section.file_offset as u64);
                        cursor.write_bytes(data)?;
                        cursor.pop_position()?;
                    }
                }
            }
        }
        cursor.ensure_size(file_extent);

        Ok(())
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentCommand> {
        self.commands.iter().filter_map(|command| match command {
            LoadCommand::Segment(segment) => Some(segment),
            _ => None,
        })
    }

    /// The unique `__LINKEDIT` segment.
    pub fn linkedit_segment(&self) -> Result<&SegmentCommand, SigningError> {
        let mut linkedit = None;
        for segment in self.segments().filter(|s| s.name == SEG_LINKEDIT) {
            if linkedit.replace(segment).is_some() {
                return Err(SigningError::MultipleLinkedit);
            }
        }

        linkedit.ok_or(SigningError::MissingLinkedit)
    }

    pub fn code_signature_command(&self) -> Option<&CodeSignatureCommand> {
        self.commands.iter().find_map(|command| match command {
            LoadCommand::CodeSignature(signature) => Some(signature),
            _ => None,
        })
    }

    /// Validate the layout constraints re-signing relies on and return the
    /// reserved signature region as `(file offset, size)`.
    ///
    /// The signature region must end exactly at `__LINKEDIT`'s end and
    /// `__LINKEDIT` must be the file's final segment; anything else would
    /// require re-laying out the binary, which is out of scope.
    pub fn signature_region(&self) -> Result<(u64, u64), SigningError> {
        let signature = self
            .code_signature_command()
            .ok_or(SigningError::CodeSignatureCommandMissing)?;
        let linkedit = self.linkedit_segment()?;

        if signature.data_end() != linkedit.file_end() {
            return Err(SigningError::SignatureNotAtLinkeditEnd);
        }

        if self
            .segments()
            .any(|segment| segment.file_end() > linkedit.file_end())
        {
            return Err(SigningError::InvalidBinary(
                "__LINKEDIT is not the final segment",
            ));
        }

        Ok((signature.data_offset as u64, signature.data_size as u64))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stub_round_trip() {
        let data = testutil::synthesize_stub(0x1000);

        let mut cursor = ReadCursor::new(&data, scroll::LE);
        let mut image = MachObjectFile::parse(&mut cursor).unwrap();

        assert_eq!(image.address_size, AddressSize::Bits64);
        assert_eq!(image.cpu_type, testutil::CPU_TYPE_ARM64);
        assert_eq!(image.commands.len(), 6);

        let linkedit = image.linkedit_segment().unwrap();
        assert_eq!(linkedit.file_offset, testutil::LINKEDIT_OFFSET);

        let mut out = WriteCursor::new(scroll::LE);
        image.write(&mut out).unwrap();
        assert_eq!(out.into_inner(), data);
    }

    #[test]
    fn signature_region_constraints() {
        let data = testutil::synthesize_stub(0x1000);
        let mut cursor = ReadCursor::new(&data, scroll::LE);
        let image = MachObjectFile::parse(&mut cursor).unwrap();

        let (offset, size) = image.signature_region().unwrap();
        assert_eq!(
            offset,
            testutil::LINKEDIT_OFFSET + testutil::PRE_SIGNATURE_LINKEDIT
        );
        assert_eq!(size, 0x1000);

        let mut no_signature = image.clone();
        no_signature
            .commands
            .retain(|c| !matches!(c, LoadCommand::CodeSignature(_)));
        assert!(matches!(
            no_signature.signature_region(),
            Err(SigningError::CodeSignatureCommandMissing)
        ));

        let mut misplaced = image.clone();
        for command in &mut misplaced.commands {
            if let LoadCommand::CodeSignature(sig) = command {
                sig.data_size -= 4;
            }
        }
        assert!(matches!(
            misplaced.signature_region(),
            Err(SigningError::SignatureNotAtLinkeditEnd)
        ));

        let mut no_linkedit = image;
        no_linkedit.commands.retain(|c| {
            !matches!(c, LoadCommand::Segment(segment) if segment.name == SEG_LINKEDIT)
        });
        assert!(matches!(
            no_linkedit.signature_region(),
            Err(SigningError::MissingLinkedit)
        ));
    }

    #[test]
    fn unknown_command_preserved_verbatim() {
        let mut data = testutil::synthesize_stub(0x1000);

        // Rewrite the UUID command code to something unrecognized.
        let mut cursor = ReadCursor::new(&data, scroll::LE);
        let image = MachObjectFile::parse(&mut cursor).unwrap();
        let uuid_offset = image
            .commands
            .iter()
            .find_map(|c| match c {
                LoadCommand::Uuid(u) => Some(u.command_offset),
                _ => None,
            })
            .unwrap();
        data[uuid_offset as usize] = 0x7f;

        let mut cursor = ReadCursor::new(&data, scroll::LE);
        let mut reparsed = MachObjectFile::parse(&mut cursor).unwrap();
        assert!(reparsed
            .commands
            .iter()
            .any(|c| matches!(c, LoadCommand::Opaque(o) if o.command == 0x7f)));

        let mut out = WriteCursor::new(scroll::LE);
        reparsed.write(&mut out).unwrap();
        assert_eq!(out.into_inner(), data);
    }

    #[test]
    fn patch_code_signature_region_in_place() {
        let data = testutil::synthesize_stub(0x1000);
        let mut cursor = ReadCursor::new(&data, scroll::LE);
        let image = MachObjectFile::parse(&mut cursor).unwrap();
        let signature = image.code_signature_command().unwrap();

        let mut patcher = WriteCursor::with_buffer(data.clone(), 0, scroll::LE);
        signature.patch_region(&mut patcher, 0x4040, 0xfc0).unwrap();
        let patched = patcher.into_inner();

        assert_eq!(patched.len(), data.len());
        let mut cursor = ReadCursor::new(&patched, scroll::LE);
        let reparsed = MachObjectFile::parse(&mut cursor).unwrap();
        let signature = reparsed.code_signature_command().unwrap();
        assert_eq!(signature.data_offset, 0x4040);
        assert_eq!(signature.data_size, 0xfc0);
    }
}
