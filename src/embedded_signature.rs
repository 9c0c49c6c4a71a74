// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing data structures.
//!
//! Embedded signatures are a hierarchy of *blobs*: each serializes as a
//! big-endian `u32` magic, a `u32` length (including the 8-byte header), and
//! a payload. The top-level blob is a *SuperBlob*: a slot table mapping
//! numeric slot identifiers to child blobs, with offsets expressed relative
//! to the superblob's own header. Wire data is big-endian regardless of the
//! endianness of the Mach-O carrying it.

use {
    crate::{
        binary_io::{FieldWidth, WriteCursor},
        code_directory::CodeDirectoryBlob,
        code_requirement::CodeRequirements,
        error::SigningError,
    },
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        fmt::{Display, Formatter},
        io::Write,
    },
};

/// Magic numbers identifying blob types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeSigningMagic {
    /// A single requirement expression.
    Requirement,
    /// Requirements table keyed by requirement type.
    RequirementSet,
    /// The code directory.
    CodeDirectory,
    /// Top-level embedded signature superblob.
    EmbeddedSignature,
    /// Entitlements XML.
    Entitlements,
    /// CMS signature wrapper.
    BlobWrapper,
    /// Unrecognized magic, preserved numerically.
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade7171 => Self::Entitlements,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// Slots within an embedded signature superblob.
///
/// Declared in ascending numeric order so the derived ordering matches the
/// order slots must appear in the slot table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    /// Reserved by the format; its special slot digest is always zero.
    Application,
    Entitlements,
    Signature,
    Unknown(u32),
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            0x10000 => Self::Signature,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(slot: CodeSigningSlot) -> u32 {
        match slot {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

/// Requirement types within a requirement set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(t: RequirementType) -> u32 {
        match t {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Unknown(v) => v,
        }
    }
}

impl Display for RequirementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Guest => f.write_str("guest"),
            Self::Designated => f.write_str("designated"),
            Self::Library => f.write_str("library"),
            Self::Unknown(v) => write!(f, "unknown({})", v),
        }
    }
}

/// Digest algorithms used inside signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestType {
    Sha1,
    Sha256,
}

impl DigestType {
    /// Numeric hash type as stored in the code directory.
    pub fn code_directory_id(&self) -> u8 {
        match self {
            Self::Sha1 => 1,
            Self::Sha256 => 2,
        }
    }

    pub fn hash_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    pub fn digest_data(&self, data: &[u8]) -> Vec<u8> {
        let algorithm = match self {
            Self::Sha1 => &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &ring::digest::SHA256,
        };

        ring::digest::digest(algorithm, data).as_ref().to_vec()
    }
}

impl TryFrom<u8> for DigestType {
    type Error = SigningError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Sha1),
            2 => Ok(Self::Sha256),
            _ => Err(SigningError::DigestUnknownAlgorithm),
        }
    }
}

/// A digest value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.to_vec()),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}

impl<'a> From<Vec<u8>> for Digest<'a> {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

/// Parse a blob header, returning `(magic, declared length, payload)`.
pub fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), SigningError> {
    let magic = data.pread_with::<u32>(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)? as usize;

    if length < 8 || length > data.len() {
        return Err(SigningError::SuperblobMalformed);
    }

    Ok((magic, length, &data[8..length]))
}

fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected: u32,
    name: &'static str,
) -> Result<&'a [u8], SigningError> {
    let (magic, _, payload) = read_blob_header(data)?;

    if magic != expected {
        Err(SigningError::BadMagic(name))
    } else {
        Ok(payload)
    }
}

/// Common interface for blob types.
pub trait Blob<'a>
where
    Self: Sized,
{
    fn magic() -> u32;

    /// Construct an instance by parsing a full blob (header included).
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, SigningError>;

    fn serialize_payload(&self) -> Result<Vec<u8>, SigningError>;

    /// Serialize to bytes, with the blob header.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, SigningError> {
        let payload = self.serialize_payload()?;

        let mut res = Vec::with_capacity(payload.len() + 8);
        res.iowrite_with(Self::magic(), scroll::BE)?;
        res.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;
        res.write_all(&payload)?;

        Ok(res)
    }

    fn digest_with(&self, hash: DigestType) -> Result<Vec<u8>, SigningError> {
        Ok(hash.digest_data(&self.to_blob_bytes()?))
    }
}

/// A single requirement expression blob, payload kept opaque.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequirementBlob<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for RequirementBlob<'a> {
    fn magic() -> u32 {
        CodeSigningMagic::Requirement.into()
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, SigningError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "requirement blob")?;

        Ok(Self { data: data.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, SigningError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> RequirementBlob<'a> {
    pub fn to_owned(&self) -> RequirementBlob<'static> {
        RequirementBlob {
            data: Cow::Owned(self.data.to_vec()),
        }
    }

    /// Parse the payload into requirement expressions.
    pub fn parse_expressions(&self) -> Result<CodeRequirements<'_>, SigningError> {
        Ok(CodeRequirements::parse_binary(&self.data)?.0)
    }
}

/// Requirement set: a table of requirement blobs keyed by requirement type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequirementSetBlob<'a> {
    pub requirements: Vec<(RequirementType, RequirementBlob<'a>)>,
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic() -> u32 {
        CodeSigningMagic::RequirementSet.into()
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, SigningError> {
        read_and_validate_blob_header(data, Self::magic(), "requirement set blob")?;

        // Offsets are relative to the start of the blob, header included.
        let count = data.pread_with::<u32>(8, scroll::BE)?;

        let mut requirements = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let typ = data.pread_with::<u32>(12 + i * 8, scroll::BE)?;
            let offset = data.pread_with::<u32>(16 + i * 8, scroll::BE)? as usize;

            if offset > data.len() {
                return Err(SigningError::SuperblobMalformed);
            }

            requirements.push((
                RequirementType::from(typ),
                RequirementBlob::from_blob_bytes(&data[offset..])?,
            ));
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, SigningError> {
        let mut res = Vec::new();
        res.iowrite_with(self.requirements.len() as u32, scroll::BE)?;

        // Index entries are 8 bytes each; offsets include the blob header.
        let mut offset = 8 + 4 + 8 * self.requirements.len();
        let mut children = Vec::with_capacity(self.requirements.len());

        for (typ, requirement) in &self.requirements {
            let child = requirement.to_blob_bytes()?;
            res.iowrite_with(u32::from(*typ), scroll::BE)?;
            res.iowrite_with(offset as u32, scroll::BE)?;
            offset += child.len();
            children.push(child);
        }

        for child in children {
            res.write_all(&child)?;
        }

        Ok(res)
    }
}

impl<'a> RequirementSetBlob<'a> {
    pub fn to_owned(&self) -> RequirementSetBlob<'static> {
        RequirementSetBlob {
            requirements: self
                .requirements
                .iter()
                .map(|(typ, req)| (*typ, req.to_owned()))
                .collect(),
        }
    }

    pub fn set_requirement(&mut self, typ: RequirementType, blob: RequirementBlob<'a>) {
        self.requirements.retain(|(t, _)| *t != typ);
        self.requirements.push((typ, blob));
        self.requirements.sort_by_key(|(t, _)| u32::from(*t));
    }

    pub fn requirement(&self, typ: RequirementType) -> Option<&RequirementBlob<'a>> {
        self.requirements
            .iter()
            .find_map(|(t, blob)| if *t == typ { Some(blob) } else { None })
    }
}

/// Entitlements: an opaque UTF-8 XML plist payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        CodeSigningMagic::Entitlements.into()
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, SigningError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "entitlements blob")?;
        let s = std::str::from_utf8(data).map_err(SigningError::EntitlementsBadUtf8)?;

        Ok(Self { plist: s.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, SigningError> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

impl<'a> EntitlementsBlob<'a> {
    pub fn from_string(s: &(impl ToString + ?Sized)) -> EntitlementsBlob<'static> {
        EntitlementsBlob {
            plist: s.to_string().into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.plist
    }
}

/// Wrapper holding opaque signature data (the CMS `SignedData` DER).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobWrapperBlob<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        CodeSigningMagic::BlobWrapper.into()
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, SigningError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "blob wrapper blob")?;

        Ok(Self { data: data.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, SigningError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> BlobWrapperBlob<'a> {
    pub fn from_data_owned(data: Vec<u8>) -> BlobWrapperBlob<'static> {
        BlobWrapperBlob { data: data.into() }
    }
}

/// Any other blob, preserved with its magic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtherBlob<'a> {
    pub magic: u32,
    pub data: Cow<'a, [u8]>,
}

impl<'a> OtherBlob<'a> {
    pub fn from_blob_bytes(data: &'a [u8]) -> Result<Self, SigningError> {
        let (magic, _, payload) = read_blob_header(data)?;

        Ok(Self {
            magic,
            data: payload.into(),
        })
    }

    pub fn to_blob_bytes(&self) -> Result<Vec<u8>, SigningError> {
        let mut res = Vec::with_capacity(self.data.len() + 8);
        res.iowrite_with(self.magic, scroll::BE)?;
        res.iowrite_with(self.data.len() as u32 + 8, scroll::BE)?;
        res.write_all(&self.data)?;

        Ok(res)
    }
}

/// A parsed blob, dispatched on its magic.
#[derive(Clone, Debug)]
pub enum BlobData<'a> {
    Requirement(Box<RequirementBlob<'a>>),
    RequirementSet(Box<RequirementSetBlob<'a>>),
    CodeDirectory(Box<CodeDirectoryBlob<'a>>),
    Entitlements(Box<EntitlementsBlob<'a>>),
    BlobWrapper(Box<BlobWrapperBlob<'a>>),
    Other(Box<OtherBlob<'a>>),
}

impl<'a> BlobData<'a> {
    /// Parse a full blob, choosing the variant from its magic.
    pub fn from_blob_bytes(data: &'a [u8]) -> Result<Self, SigningError> {
        let (magic, _, _) = read_blob_header(data)?;

        Ok(match CodeSigningMagic::from(magic) {
            CodeSigningMagic::Requirement => {
                Self::Requirement(Box::new(RequirementBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::RequirementSet => {
                Self::RequirementSet(Box::new(RequirementSetBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::CodeDirectory => {
                Self::CodeDirectory(Box::new(CodeDirectoryBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::Entitlements => {
                Self::Entitlements(Box::new(EntitlementsBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::BlobWrapper => {
                Self::BlobWrapper(Box::new(BlobWrapperBlob::from_blob_bytes(data)?))
            }
            _ => Self::Other(Box::new(OtherBlob::from_blob_bytes(data)?)),
        })
    }

    pub fn to_blob_bytes(&self) -> Result<Vec<u8>, SigningError> {
        match self {
            Self::Requirement(b) => b.to_blob_bytes(),
            Self::RequirementSet(b) => b.to_blob_bytes(),
            Self::CodeDirectory(b) => b.to_blob_bytes(),
            Self::Entitlements(b) => b.to_blob_bytes(),
            Self::BlobWrapper(b) => b.to_blob_bytes(),
            Self::Other(b) => b.to_blob_bytes(),
        }
    }

    pub fn digest_with(&self, hash: DigestType) -> Result<Vec<u8>, SigningError> {
        Ok(hash.digest_data(&self.to_blob_bytes()?))
    }
}

impl<'a> From<CodeDirectoryBlob<'a>> for BlobData<'a> {
    fn from(cd: CodeDirectoryBlob<'a>) -> Self {
        Self::CodeDirectory(Box::new(cd))
    }
}

impl<'a> From<RequirementSetBlob<'a>> for BlobData<'a> {
    fn from(blob: RequirementSetBlob<'a>) -> Self {
        Self::RequirementSet(Box::new(blob))
    }
}

impl<'a> From<EntitlementsBlob<'a>> for BlobData<'a> {
    fn from(blob: EntitlementsBlob<'a>) -> Self {
        Self::Entitlements(Box::new(blob))
    }
}

impl<'a> From<BlobWrapperBlob<'a>> for BlobData<'a> {
    fn from(blob: BlobWrapperBlob<'a>) -> Self {
        Self::BlobWrapper(Box::new(blob))
    }
}

/// An entry in a superblob's slot table.
#[derive(Clone, Debug)]
pub struct BlobEntry<'a> {
    pub slot: CodeSigningSlot,
    /// Offset from the start of the superblob.
    pub offset: usize,
    pub magic: CodeSigningMagic,
    pub length: usize,
    /// Full blob bytes, header included.
    pub data: &'a [u8],
}

impl<'a> BlobEntry<'a> {
    pub fn parse(&self) -> Result<BlobData<'a>, SigningError> {
        BlobData::from_blob_bytes(self.data)
    }

    pub fn digest_with(&self, hash: DigestType) -> Vec<u8> {
        hash.digest_data(self.data)
    }
}

/// A parsed embedded signature superblob.
#[derive(Clone, Debug)]
pub struct EmbeddedSignature<'a> {
    /// Declared total length of the superblob.
    pub length: u32,
    pub count: u32,
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> EmbeddedSignature<'a> {
    /// Parse the top-level superblob from its serialized form.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, SigningError> {
        let magic = data.pread_with::<u32>(0, scroll::BE)?;
        if magic != u32::from(CodeSigningMagic::EmbeddedSignature) {
            return Err(SigningError::BadMagic("embedded signature"));
        }

        let length = data.pread_with::<u32>(4, scroll::BE)?;
        if (length as usize) < 12 || length as usize > data.len() {
            return Err(SigningError::SuperblobMalformed);
        }
        let count = data.pread_with::<u32>(8, scroll::BE)?;

        let mut indices = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            indices.push((
                data.pread_with::<u32>(12 + i * 8, scroll::BE)?,
                data.pread_with::<u32>(16 + i * 8, scroll::BE)? as usize,
            ));
        }

        let mut blobs = Vec::with_capacity(indices.len());
        for (i, (slot, offset)) in indices.iter().enumerate() {
            let end = if i + 1 < indices.len() {
                indices[i + 1].1
            } else {
                length as usize
            };

            match offset.cmp(&end) {
                Ordering::Greater => return Err(SigningError::SuperblobMalformed),
                Ordering::Equal => return Err(SigningError::SuperblobMalformed),
                Ordering::Less => {}
            }
            if end > data.len() {
                return Err(SigningError::SuperblobMalformed);
            }

            let blob_data = &data[*offset..end];
            let (blob_magic, blob_length, _) = read_blob_header(blob_data)?;

            blobs.push(BlobEntry {
                slot: CodeSigningSlot::from(*slot),
                offset: *offset,
                magic: CodeSigningMagic::from(blob_magic),
                length: blob_length,
                data: blob_data,
            });
        }

        Ok(Self {
            length,
            count,
            blobs,
        })
    }

    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|entry| entry.slot == slot)
    }

    /// The parsed code directory, if present.
    pub fn code_directory(&self) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, SigningError> {
        match self.find_slot(CodeSigningSlot::CodeDirectory) {
            Some(entry) => match entry.parse()? {
                BlobData::CodeDirectory(cd) => Ok(Some(cd)),
                _ => Err(SigningError::BadMagic("code directory slot")),
            },
            None => Ok(None),
        }
    }

    /// The parsed requirement set, if present.
    pub fn requirement_set(&self) -> Result<Option<Box<RequirementSetBlob<'a>>>, SigningError> {
        match self.find_slot(CodeSigningSlot::RequirementSet) {
            Some(entry) => match entry.parse()? {
                BlobData::RequirementSet(set) => Ok(Some(set)),
                _ => Err(SigningError::BadMagic("requirement set slot")),
            },
            None => Ok(None),
        }
    }

    /// Raw CMS signature data, if present.
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, SigningError> {
        match self.find_slot(CodeSigningSlot::Signature) {
            Some(entry) => match entry.parse()? {
                BlobData::BlobWrapper(wrapper) => match wrapper.data {
                    Cow::Borrowed(data) => Ok(Some(data)),
                    Cow::Owned(_) => Err(SigningError::SuperblobMalformed),
                },
                _ => Err(SigningError::BadMagic("signature slot")),
            },
            None => Ok(None),
        }
    }
}

/// Serialize a superblob from already-serialized child blobs.
///
/// Slot offsets are committed through the deferred-offset mechanism once each
/// child's true position is known.
pub fn create_superblob<'a>(
    magic: CodeSigningMagic,
    blobs: impl Iterator<Item = &'a (CodeSigningSlot, Vec<u8>)>,
) -> Result<Vec<u8>, SigningError> {
    let blobs = blobs.collect::<Vec<_>>();

    let mut cursor = WriteCursor::new(scroll::BE);
    cursor.write_u32(magic.into())?;
    let length_field = cursor.defer_field(0, FieldWidth::U32)?;
    cursor.write_u32(blobs.len() as u32)?;

    let mut offset_fields = Vec::with_capacity(blobs.len());
    for (slot, _) in &blobs {
        cursor.write_u32(u32::from(*slot))?;
        offset_fields.push(cursor.defer_field(0, FieldWidth::U32)?);
    }

    for ((_, data), offset_field) in blobs.iter().zip(offset_fields) {
        cursor.commit_value(offset_field, cursor.position())?;
        cursor.write_bytes(data)?;
    }

    cursor.commit_length(length_field)?;

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblob() -> Vec<u8> {
        let requirements = RequirementSetBlob::default();
        let entitlements = EntitlementsBlob::from_string("<plist/>");
        let wrapper = BlobWrapperBlob::from_data_owned(vec![0xde, 0xad, 0xbe, 0xef]);

        let blobs = vec![
            (
                CodeSigningSlot::RequirementSet,
                requirements.to_blob_bytes().unwrap(),
            ),
            (
                CodeSigningSlot::Entitlements,
                entitlements.to_blob_bytes().unwrap(),
            ),
            (CodeSigningSlot::Signature, wrapper.to_blob_bytes().unwrap()),
        ];

        create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter()).unwrap()
    }

    #[test]
    fn superblob_round_trip_is_byte_identical() {
        let data = sample_superblob();

        let signature = EmbeddedSignature::from_bytes(&data).unwrap();
        assert_eq!(signature.count, 3);
        assert_eq!(signature.length as usize, data.len());

        // Re-serialize each parsed blob and rebuild the superblob.
        let blobs = signature
            .blobs
            .iter()
            .map(|entry| Ok((entry.slot, entry.parse()?.to_blob_bytes()?)))
            .collect::<Result<Vec<_>, SigningError>>()
            .unwrap();
        let rebuilt = create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter()).unwrap();

        assert_eq!(rebuilt, data);
    }

    #[test]
    fn superblob_slot_lookup() {
        let data = sample_superblob();
        let signature = EmbeddedSignature::from_bytes(&data).unwrap();

        assert!(signature.find_slot(CodeSigningSlot::Entitlements).is_some());
        assert!(signature.find_slot(CodeSigningSlot::CodeDirectory).is_none());
        assert_eq!(
            signature.signature_data().unwrap(),
            Some(&[0xde, 0xad, 0xbe, 0xef][..])
        );
    }

    #[test]
    fn blob_length_includes_header() {
        let entitlements = EntitlementsBlob::from_string("x");
        let data = entitlements.to_blob_bytes().unwrap();

        assert_eq!(data.len(), 9);
        let (magic, length, payload) = read_blob_header(&data).unwrap();
        assert_eq!(magic, 0xfade7171);
        assert_eq!(length, 9);
        assert_eq!(payload, b"x");
    }

    #[test]
    fn malformed_superblob_is_rejected() {
        let mut data = sample_superblob();

        // Truncate the declared length below the header size.
        data[4..8].copy_from_slice(&4u32.to_be_bytes());
        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(SigningError::SuperblobMalformed)
        ));

        let mut data = sample_superblob();
        data[0..4].copy_from_slice(&0xfade0c02u32.to_be_bytes());
        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(SigningError::BadMagic(_))
        ));
    }

    #[test]
    fn requirement_set_offsets_relative_to_blob_start() {
        let mut set = RequirementSetBlob::default();
        set.set_requirement(
            RequirementType::Designated,
            RequirementBlob {
                data: vec![0u8; 4].into(),
            },
        );

        let data = set.to_blob_bytes().unwrap();
        // magic + length + count + one (type, offset) entry.
        let offset = u32::from_be_bytes(data[16..20].try_into().unwrap());
        assert_eq!(offset, 20);
        assert_eq!(
            u32::from_be_bytes(data[20..24].try_into().unwrap()),
            0xfade0c00
        );

        let parsed = RequirementSetBlob::from_blob_bytes(&data).unwrap();
        assert_eq!(parsed, set);
        assert_eq!(parsed.to_blob_bytes().unwrap(), data);
    }
}
