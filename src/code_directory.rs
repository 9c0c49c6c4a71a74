// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure.
//!
//! The code directory is the central record of a signature: it holds the
//! digest of every page of signed code plus *special slot* digests for
//! auxiliary blobs (requirements, entitlements, the Info.plist, the resource
//! catalog). Special slots are indexed negatively from the hash array's
//! origin; code page slots count up from it.

use {
    crate::{
        binary_io::{FieldWidth, WriteCursor},
        embedded_signature::{Blob, CodeSigningMagic, CodeSigningSlot, Digest, DigestType},
        error::SigningError,
    },
    scroll::Pread,
    std::{borrow::Cow, collections::BTreeMap},
};

/// Code directory version carrying the team identifier field.
pub const CD_VERSION_SUPPORTS_TEAM_ID: u32 = 0x20200;

/// Code directory version introducing the scatter offset field.
const CD_VERSION_SUPPORTS_SCATTER: u32 = 0x20100;

bitflags::bitflags! {
    /// Code signature flags stored in the code directory.
    pub struct CodeSignatureFlags: u32 {
        const HOST = 0x0001;
        const ADHOC = 0x0002;
        const FORCE_HARD = 0x0100;
        const FORCE_KILL = 0x0200;
        const FORCE_EXPIRATION = 0x0400;
        const RESTRICT = 0x0800;
        const ENFORCEMENT = 0x1000;
        const LIBRARY_VALIDATION = 0x2000;
        const RUNTIME = 0x10000;
        const LINKER_SIGNED = 0x20000;
    }
}

/// Number of 4096-byte pages needed to cover `code_limit` bytes.
pub fn code_slot_count(code_limit: u32, page_size_log2: u8) -> u32 {
    let page_size = 1u32 << page_size_log2;
    (code_limit + page_size - 1) / page_size
}

/// A parsed or under-construction code directory.
///
/// String and hash array offsets are not stored; they are recomputed on every
/// serialization, so a parse/serialize round trip of a directory we produced
/// is byte-identical.
#[derive(Clone, Debug)]
pub struct CodeDirectoryBlob<'a> {
    pub version: u32,
    pub flags: CodeSignatureFlags,
    pub code_limit: u32,
    pub digest_type: DigestType,
    pub platform: u8,
    /// log2 of the page size used for code digests.
    pub page_size_log2: u8,
    pub spare2: u32,
    pub ident: Cow<'a, str>,
    pub team_name: Option<Cow<'a, str>>,
    /// Digests for special slots, keyed by the slot they protect.
    pub special_digests: BTreeMap<CodeSigningSlot, Digest<'a>>,
    pub code_digests: Vec<Digest<'a>>,
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        CodeSigningMagic::CodeDirectory.into()
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, SigningError> {
        let magic = data.pread_with::<u32>(0, scroll::BE)?;
        if magic != Self::magic() {
            return Err(SigningError::BadMagic("code directory"));
        }
        let length = data.pread_with::<u32>(4, scroll::BE)? as usize;
        if length < 8 || length > data.len() {
            return Err(SigningError::SuperblobMalformed);
        }
        let data = &data[..length];

        let offset = &mut 8;
        let version = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = CodeSignatureFlags::from_bits_truncate(flags);
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)? as usize;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)? as usize;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let code_limit = data.gread_with::<u32>(offset, scroll::BE)?;
        let hash_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let hash_type = data.gread_with::<u8>(offset, scroll::BE)?;
        let platform = data.gread_with::<u8>(offset, scroll::BE)?;
        let page_size_log2 = data.gread_with::<u8>(offset, scroll::BE)?;
        let spare2 = data.gread_with::<u32>(offset, scroll::BE)?;

        let _scatter_offset = if version >= CD_VERSION_SUPPORTS_SCATTER {
            Some(data.gread_with::<u32>(offset, scroll::BE)?)
        } else {
            None
        };
        let team_offset = if version >= CD_VERSION_SUPPORTS_TEAM_ID {
            Some(data.gread_with::<u32>(offset, scroll::BE)? as usize)
        } else {
            None
        };

        let digest_type = DigestType::try_from(hash_type)?;
        if digest_type.hash_len() != hash_size as usize {
            return Err(SigningError::DigestUnknownAlgorithm);
        }

        let ident = read_nul_terminated(data, ident_offset)
            .ok_or(SigningError::CodeDirectoryMalformedIdentifier)?;
        let team_name = match team_offset {
            Some(team_offset) if team_offset != 0 => Some(
                read_nul_terminated(data, team_offset)
                    .ok_or(SigningError::CodeDirectoryMalformedTeam)?,
            ),
            _ => None,
        };

        let hash_size = hash_size as usize;
        let specials_start = hash_offset
            .checked_sub(n_special_slots as usize * hash_size)
            .ok_or(SigningError::SuperblobMalformed)?;
        let hashes_end = hash_offset + n_code_slots as usize * hash_size;
        if hashes_end > data.len() {
            return Err(SigningError::SuperblobMalformed);
        }

        // Special slot digests are stored at negative indices: the digest for
        // slot -i lives at hash_offset - i * hash_size.
        let mut special_digests = BTreeMap::new();
        for i in 0..n_special_slots as usize {
            let slot = CodeSigningSlot::from(n_special_slots - i as u32);
            let start = specials_start + i * hash_size;
            special_digests.insert(
                slot,
                Digest {
                    data: Cow::Borrowed(&data[start..start + hash_size]),
                },
            );
        }

        let code_digests = (0..n_code_slots as usize)
            .map(|i| {
                let start = hash_offset + i * hash_size;
                Digest {
                    data: Cow::Borrowed(&data[start..start + hash_size]),
                }
            })
            .collect();

        Ok(Self {
            version,
            flags,
            code_limit,
            digest_type,
            platform,
            page_size_log2,
            spare2,
            ident: ident.into(),
            team_name: team_name.map(|t| t.into()),
            special_digests,
            code_digests,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, SigningError> {
        let mut cursor = WriteCursor::new(scroll::BE);

        cursor.write_u32(self.version)?;
        cursor.write_u32(self.flags.bits())?;
        // All offsets are relative to the blob start, which is 8 bytes before
        // the payload this routine produces.
        let hash_offset_field = cursor.defer_field(0, FieldWidth::U32)?;
        let ident_offset_field = cursor.defer_field(0, FieldWidth::U32)?;

        let n_special_slots = self.highest_special_slot_index();
        cursor.write_u32(n_special_slots)?;
        cursor.write_u32(self.code_digests.len() as u32)?;
        cursor.write_u32(self.code_limit)?;
        cursor.write_u8(self.digest_type.hash_len() as u8)?;
        cursor.write_u8(self.digest_type.code_directory_id())?;
        cursor.write_u8(self.platform)?;
        cursor.write_u8(self.page_size_log2)?;
        cursor.write_u32(self.spare2)?;

        if self.version >= CD_VERSION_SUPPORTS_SCATTER {
            cursor.write_u32(0)?;
        }
        let team_offset_field = if self.version >= CD_VERSION_SUPPORTS_TEAM_ID {
            Some(cursor.defer_field(0, FieldWidth::U32)?)
        } else {
            None
        };

        cursor.commit_value(ident_offset_field, cursor.position() + 8)?;
        cursor.write_bytes(self.ident.as_bytes())?;
        cursor.write_u8(0)?;

        if let Some(team_offset_field) = team_offset_field {
            match &self.team_name {
                Some(team_name) => {
                    cursor.commit_value(team_offset_field, cursor.position() + 8)?;
                    cursor.write_bytes(team_name.as_bytes())?;
                    cursor.write_u8(0)?;
                }
                None => {
                    cursor.commit_value(team_offset_field, 0)?;
                }
            }
        }

        let hash_size = self.digest_type.hash_len();
        for i in 0..n_special_slots {
            let slot = CodeSigningSlot::from(n_special_slots - i);
            match self.special_digests.get(&slot) {
                Some(digest) => {
                    if digest.data.len() != hash_size {
                        return Err(SigningError::SignatureBuilder(
                            "special slot digest has wrong length",
                        ));
                    }
                    cursor.write_bytes(&digest.data)?;
                }
                None => cursor.write_zeros(hash_size)?,
            }
        }

        cursor.commit_value(hash_offset_field, cursor.position() + 8)?;
        for digest in &self.code_digests {
            if digest.data.len() != hash_size {
                return Err(SigningError::SignatureBuilder("code digest has wrong length"));
            }
            cursor.write_bytes(&digest.data)?;
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    /// Create a directory with the layout we emit when signing.
    pub fn new(ident: impl Into<Cow<'a, str>>, code_limit: u32) -> Self {
        Self {
            version: CD_VERSION_SUPPORTS_TEAM_ID,
            flags: CodeSignatureFlags::empty(),
            code_limit,
            digest_type: DigestType::Sha1,
            platform: 0,
            page_size_log2: 12,
            spare2: 0,
            ident: ident.into(),
            team_name: None,
            special_digests: BTreeMap::new(),
            code_digests: Vec::new(),
        }
    }

    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            code_limit: self.code_limit,
            digest_type: self.digest_type,
            platform: self.platform,
            page_size_log2: self.page_size_log2,
            spare2: self.spare2,
            ident: Cow::Owned(self.ident.to_string()),
            team_name: self.team_name.as_ref().map(|t| Cow::Owned(t.to_string())),
            special_digests: self
                .special_digests
                .iter()
                .map(|(slot, digest)| (*slot, digest.to_owned()))
                .collect(),
            code_digests: self.code_digests.iter().map(|d| d.to_owned()).collect(),
        }
    }

    pub fn set_team_name(&mut self, team_name: impl Into<Cow<'a, str>>) {
        self.team_name = Some(team_name.into());
    }

    pub fn set_special_digest(&mut self, slot: CodeSigningSlot, digest: Digest<'a>) {
        self.special_digests.insert(slot, digest);
    }

    /// Compute code page digests over `code_data` and install them.
    pub fn compute_code_digests(&mut self, code_data: &[u8]) {
        let page_size = 1usize << self.page_size_log2;
        self.code_digests = code_data
            .chunks(page_size)
            .map(|page| Digest {
                data: self.digest_type.digest_data(page).into(),
            })
            .collect();
    }

    /// Highest populated special slot index. The directory must reserve every
    /// slot up to it, with absent slots filled by zero digests.
    fn highest_special_slot_index(&self) -> u32 {
        self.special_digests
            .keys()
            .map(|slot| u32::from(*slot))
            .filter(|v| *v < 0x10000)
            .max()
            .unwrap_or(0)
    }
}

fn read_nul_terminated(data: &[u8], offset: usize) -> Option<String> {
    let tail = data.get(offset..)?;
    let nul = tail.iter().position(|&b| b == 0)?;

    String::from_utf8(tail[..nul].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(byte: u8) -> Digest<'static> {
        Digest {
            data: vec![byte; 20].into(),
        }
    }

    #[test]
    fn code_slot_counts_around_page_boundary() {
        assert_eq!(code_slot_count(4095, 12), 1);
        assert_eq!(code_slot_count(4096, 12), 1);
        assert_eq!(code_slot_count(4097, 12), 2);
        assert_eq!(code_slot_count(0, 12), 0);
    }

    #[test]
    fn serialize_parse_round_trip() {
        let mut cd = CodeDirectoryBlob::new("com.example.app", 0x3000);
        cd.set_team_name("TESTTEAM12");
        cd.set_special_digest(CodeSigningSlot::RequirementSet, digest_of(0xaa));
        cd.set_special_digest(CodeSigningSlot::Entitlements, digest_of(0xbb));
        cd.compute_code_digests(&[0u8; 0x3000]);
        assert_eq!(cd.code_digests.len(), 3);

        let data = cd.to_blob_bytes().unwrap();
        let parsed = CodeDirectoryBlob::from_blob_bytes(&data).unwrap();

        assert_eq!(parsed.version, CD_VERSION_SUPPORTS_TEAM_ID);
        assert_eq!(parsed.ident, "com.example.app");
        assert_eq!(parsed.team_name.as_deref(), Some("TESTTEAM12"));
        assert_eq!(parsed.code_limit, 0x3000);
        assert_eq!(parsed.code_digests, cd.code_digests);

        // Slots 1, 3 and 4 were never set; the array still reserves them with
        // zero digests up to the highest populated slot (5).
        assert_eq!(parsed.special_digests.len(), 5);
        assert_eq!(
            parsed.special_digests.get(&CodeSigningSlot::Entitlements),
            Some(&digest_of(0xbb))
        );
        assert!(parsed
            .special_digests
            .get(&CodeSigningSlot::Info)
            .unwrap()
            .is_zero());

        assert_eq!(parsed.to_blob_bytes().unwrap(), data);
    }

    #[test]
    fn directory_without_team_has_zero_team_offset() {
        let cd = CodeDirectoryBlob::new("a", 0);
        let data = cd.to_blob_bytes().unwrap();

        // team offset is the 11th u32 field (after scatter).
        let team_offset = u32::from_be_bytes(data[48..52].try_into().unwrap());
        assert_eq!(team_offset, 0);

        let parsed = CodeDirectoryBlob::from_blob_bytes(&data).unwrap();
        assert!(parsed.team_name.is_none());
    }

    #[test]
    fn wrong_length_digest_is_rejected() {
        let mut cd = CodeDirectoryBlob::new("a", 0);
        cd.code_digests.push(Digest {
            data: vec![0u8; 5].into(),
        });

        assert!(matches!(
            cd.to_blob_bytes(),
            Err(SigningError::SignatureBuilder(_))
        ));
    }
}
