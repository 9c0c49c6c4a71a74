// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fat/universal binary container.
//!
//! A universal binary is a big-endian header and architecture table wrapping
//! one Mach-O image per CPU architecture. A thin Mach-O is treated as the
//! degenerate case: one member at file offset 0 with no outer header.

use {
    crate::{
        binary_io::{FieldWidth, ReadCursor, WriteCursor},
        error::SigningError,
        macho::MachObjectFile,
    },
    log::debug,
};

pub const FAT_MAGIC: u32 = 0xcafe_babe;

/// One entry of the fat architecture table.
#[derive(Clone, Copy, Debug)]
pub struct FatArch {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub offset: u32,
    pub size: u32,
    /// log2 of the member's required file alignment.
    pub align: u32,
}

/// One architecture member: its table entry (absent for thin binaries), its
/// base offset in the outer file, and the parsed image.
#[derive(Clone, Debug)]
pub struct FatMember {
    pub arch: Option<FatArch>,
    pub file_offset: u64,
    pub image: MachObjectFile,
}

/// A universal binary, or a thin Mach-O wrapped as a single member.
#[derive(Clone, Debug)]
pub struct FatBinary {
    pub members: Vec<FatMember>,
}

impl FatBinary {
    pub fn is_fat(&self) -> bool {
        self.members.first().map_or(false, |m| m.arch.is_some())
    }

    pub fn parse(data: &[u8]) -> Result<Self, SigningError> {
        let mut cursor = ReadCursor::new(data, scroll::BE);

        if cursor.read_u32()? == FAT_MAGIC {
            let arch_count = cursor.read_u32()?;
            if arch_count == 0 {
                return Err(SigningError::InvalidBinary("fat binary with no members"));
            }

            let mut table = Vec::with_capacity(arch_count as usize);
            for _ in 0..arch_count {
                table.push(FatArch {
                    cpu_type: cursor.read_u32()?,
                    cpu_subtype: cursor.read_u32()?,
                    offset: cursor.read_u32()?,
                    size: cursor.read_u32()?,
                    align: cursor.read_u32()?,
                });
            }

            let mut members = Vec::with_capacity(table.len());
            for arch in table {
                debug!(
                    "parsing fat member cpu_type=0x{:x} at offset 0x{:x}",
                    arch.cpu_type, arch.offset
                );
                let mut member_cursor = ReadCursor::new_at(data, arch.offset as u64, scroll::LE);
                let image = MachObjectFile::parse(&mut member_cursor)?;
                members.push(FatMember {
                    arch: Some(arch),
                    file_offset: arch.offset as u64,
                    image,
                });
            }

            Ok(Self { members })
        } else {
            let mut member_cursor = ReadCursor::new(data, scroll::LE);
            let image = MachObjectFile::parse(&mut member_cursor)?;

            Ok(Self {
                members: vec![FatMember {
                    arch: None,
                    file_offset: 0,
                    image,
                }],
            })
        }
    }

    /// Serialize the container. For fat binaries the architecture table is
    /// rewritten with each member's recomputed offset and size.
    pub fn write(&mut self, cursor: &mut WriteCursor) -> Result<(), SigningError> {
        if !self.is_fat() {
            let member = self
                .members
                .first_mut()
                .ok_or(SigningError::InvalidBinary("no members to write"))?;
            member.file_offset = 0;
            return member.image.write(cursor);
        }

        cursor.set_endian(scroll::BE);
        cursor.write_u32(FAT_MAGIC)?;
        cursor.write_u32(self.members.len() as u32)?;

        let mut fields = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let arch = member
                .arch
                .ok_or(SigningError::InvalidBinary("fat member missing arch entry"))?;
            cursor.write_u32(arch.cpu_type)?;
            cursor.write_u32(arch.cpu_subtype)?;
            let offset_field = cursor.defer_field(0, FieldWidth::U32)?;
            let size_field = cursor.defer_field(0, FieldWidth::U32)?;
            cursor.write_u32(arch.align)?;
            fields.push((offset_field, size_field));
        }

        for (member, (offset_field, size_field)) in self.members.iter_mut().zip(fields) {
            let alignment = 1u64 << member.arch.as_ref().map_or(14, |a| a.align);
            let mut start = cursor.len() as u64;
            let rem = start % alignment;
            if rem != 0 {
                cursor.set_position(start);
                cursor.write_zeros((alignment - rem) as usize)?;
                start += alignment - rem;
            }

            cursor.set_archive_offset(start);
            cursor.set_position(0);
            member.image.write(cursor)?;
            // The member image extends the arena to its full segment extent;
            // its size is measured from the arena, not the cursor position.
            let size = cursor.len() as u64 - start;

            cursor.set_archive_offset(0);
            cursor.set_position(cursor.len() as u64);
            cursor.set_endian(scroll::BE);
            cursor.commit_value(offset_field, start)?;
            cursor.commit_value(size_field, size)?;

            member.file_offset = start;
            if let Some(arch) = &mut member.arch {
                arch.offset = start as u32;
                arch.size = size as u32;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::macho::testutil};

    #[test]
    fn thin_binary_is_single_member() {
        let data = testutil::synthesize_stub(0x1000);
        let fat = FatBinary::parse(&data).unwrap();

        assert!(!fat.is_fat());
        assert_eq!(fat.members.len(), 1);
        assert_eq!(fat.members[0].file_offset, 0);
    }

    #[test]
    fn fat_write_then_parse_round_trips() {
        let thin = testutil::synthesize_stub(0x1000);
        let image = {
            let mut cursor = ReadCursor::new(&thin, scroll::LE);
            MachObjectFile::parse(&mut cursor).unwrap()
        };

        let mut fat = FatBinary {
            members: vec![
                FatMember {
                    arch: Some(FatArch {
                        cpu_type: testutil::CPU_TYPE_ARM64,
                        cpu_subtype: 0,
                        offset: 0,
                        size: 0,
                        align: 14,
                    }),
                    file_offset: 0,
                    image: image.clone(),
                },
                FatMember {
                    arch: Some(FatArch {
                        cpu_type: testutil::CPU_TYPE_ARM64,
                        cpu_subtype: 2,
                        offset: 0,
                        size: 0,
                        align: 14,
                    }),
                    file_offset: 0,
                    image,
                },
            ],
        };

        let mut cursor = WriteCursor::new(scroll::BE);
        fat.write(&mut cursor).unwrap();
        let data = cursor.into_inner();

        let reparsed = FatBinary::parse(&data).unwrap();
        assert!(reparsed.is_fat());
        assert_eq!(reparsed.members.len(), 2);

        let first = reparsed.members[0].arch.unwrap();
        assert_eq!(first.offset as u64, reparsed.members[0].file_offset);
        assert_eq!(first.offset % (1 << first.align), 0);
        assert_eq!(
            &data[first.offset as usize..first.offset as usize + 4],
            &thin[0..4]
        );

        // Each member re-serializes to the same bytes as the thin original.
        assert_eq!(first.size as usize, thin.len());
        assert_eq!(
            &data[first.offset as usize..first.offset as usize + first.size as usize],
            thin.as_slice()
        );
    }
}
