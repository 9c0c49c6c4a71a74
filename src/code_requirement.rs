// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code requirement expressions.
//!
//! Requirements are a small expression language constraining which
//! certificate chains may vouch for a binary. The binary encoding is a
//! preorder walk: a big-endian `u32` opcode followed by operands, where
//! variable-length operands are `u32`-length-prefixed and zero-padded to a
//! 4-byte boundary. A requirement blob payload leads with a `u32` expression
//! count.

use {
    crate::{
        embedded_signature::{Blob, RequirementBlob},
        error::SigningError,
    },
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        fmt::{Display, Formatter},
        io::Write,
    },
};

const OPCODE_IDENTIFIER: u32 = 2;
const OPCODE_ANCHOR_HASH: u32 = 4;
const OPCODE_AND: u32 = 6;
const OPCODE_CERT_FIELD: u32 = 11;
const OPCODE_CERT_GENERIC: u32 = 14;
const OPCODE_APPLE_GENERIC_ANCHOR: u32 = 15;

const MATCH_EXISTS: u32 = 0;
const MATCH_EQUAL: u32 = 1;

/// DER encoding of OID 1.2.840.113635.100.6.2.1, the certificate extension
/// marking Apple Worldwide Developer Relations intermediates.
pub const APPLE_WWDR_INTERMEDIATE_OID: &[u8] =
    &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01];

fn read_data<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a [u8], SigningError> {
    let length = data.gread_with::<u32>(offset, scroll::BE)? as usize;

    let value = data
        .get(*offset..*offset + length)
        .ok_or(SigningError::RequirementMalformed("data runs past end"))?;

    // Data is padded to a 4-byte boundary.
    *offset += length + (4 - length % 4) % 4;
    if *offset > data.len() {
        return Err(SigningError::RequirementMalformed("padding runs past end"));
    }

    Ok(value)
}

fn write_data(dest: &mut Vec<u8>, data: &[u8]) -> Result<(), SigningError> {
    dest.iowrite_with(data.len() as u32, scroll::BE)?;
    dest.write_all(data)?;
    dest.write_all(&[0u8; 4][..(4 - data.len() % 4) % 4])?;

    Ok(())
}

/// Matching clause applied to a certificate field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeRequirementMatchExpression<'a> {
    /// The field merely has to be present.
    Exists,
    /// The field must equal the given string.
    Equal(Cow<'a, str>),
}

impl<'a> CodeRequirementMatchExpression<'a> {
    fn from_bytes(data: &'a [u8], offset: &mut usize) -> Result<Self, SigningError> {
        let kind = data.gread_with::<u32>(offset, scroll::BE)?;

        match kind {
            MATCH_EXISTS => Ok(Self::Exists),
            MATCH_EQUAL => {
                let value = read_data(data, offset)?;
                let value = std::str::from_utf8(value)
                    .map_err(|_| SigningError::RequirementMalformed("match value not UTF-8"))?;
                Ok(Self::Equal(value.into()))
            }
            _ => Err(SigningError::RequirementUnknownMatchExpression(kind)),
        }
    }

    fn write_to(&self, dest: &mut Vec<u8>) -> Result<(), SigningError> {
        match self {
            Self::Exists => {
                dest.iowrite_with(MATCH_EXISTS, scroll::BE)?;
            }
            Self::Equal(value) => {
                dest.iowrite_with(MATCH_EQUAL, scroll::BE)?;
                write_data(dest, value.as_bytes())?;
            }
        }

        Ok(())
    }
}

impl<'a> Display for CodeRequirementMatchExpression<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exists => f.write_str("/* exists */"),
            Self::Equal(value) => write!(f, "= \"{}\"", value),
        }
    }
}

/// A single requirement expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeRequirementExpression<'a> {
    /// Both sub-expressions must hold.
    And(
        Box<CodeRequirementExpression<'a>>,
        Box<CodeRequirementExpression<'a>>,
    ),
    /// The signature's identifier string must equal this value.
    Identifier(Cow<'a, str>),
    /// The certificate in the given chain slot must have this digest.
    AnchorCertificateHash(i32, Cow<'a, [u8]>),
    /// A named field of a chain certificate must satisfy a match clause.
    CertificateField(i32, Cow<'a, str>, CodeRequirementMatchExpression<'a>),
    /// An extension identified by DER OID must satisfy a match clause.
    CertificateGeneric(i32, Cow<'a, [u8]>, CodeRequirementMatchExpression<'a>),
    /// The chain must terminate in an Apple generic anchor.
    AppleGenericAnchor,
}

impl<'a> CodeRequirementExpression<'a> {
    pub fn from_bytes(data: &'a [u8], offset: &mut usize) -> Result<Self, SigningError> {
        let opcode = data.gread_with::<u32>(offset, scroll::BE)?;

        match opcode {
            OPCODE_AND => {
                let a = Self::from_bytes(data, offset)?;
                let b = Self::from_bytes(data, offset)?;
                Ok(Self::And(Box::new(a), Box::new(b)))
            }
            OPCODE_IDENTIFIER => {
                let value = read_data(data, offset)?;
                let value = std::str::from_utf8(value)
                    .map_err(|_| SigningError::RequirementMalformed("identifier not UTF-8"))?;
                Ok(Self::Identifier(value.into()))
            }
            OPCODE_ANCHOR_HASH => {
                let slot = data.gread_with::<u32>(offset, scroll::BE)? as i32;
                let hash = read_data(data, offset)?;
                Ok(Self::AnchorCertificateHash(slot, hash.into()))
            }
            OPCODE_CERT_FIELD => {
                let slot = data.gread_with::<u32>(offset, scroll::BE)? as i32;
                let field = read_data(data, offset)?;
                let field = std::str::from_utf8(field)
                    .map_err(|_| SigningError::RequirementMalformed("field name not UTF-8"))?;
                let m = CodeRequirementMatchExpression::from_bytes(data, offset)?;
                Ok(Self::CertificateField(slot, field.into(), m))
            }
            OPCODE_CERT_GENERIC => {
                let slot = data.gread_with::<u32>(offset, scroll::BE)? as i32;
                let oid = read_data(data, offset)?;
                let m = CodeRequirementMatchExpression::from_bytes(data, offset)?;
                Ok(Self::CertificateGeneric(slot, oid.into(), m))
            }
            OPCODE_APPLE_GENERIC_ANCHOR => Ok(Self::AppleGenericAnchor),
            _ => Err(SigningError::RequirementUnknownOpcode(opcode)),
        }
    }

    pub fn write_to(&self, dest: &mut Vec<u8>) -> Result<(), SigningError> {
        match self {
            Self::And(a, b) => {
                dest.iowrite_with(OPCODE_AND, scroll::BE)?;
                a.write_to(dest)?;
                b.write_to(dest)?;
            }
            Self::Identifier(value) => {
                dest.iowrite_with(OPCODE_IDENTIFIER, scroll::BE)?;
                write_data(dest, value.as_bytes())?;
            }
            Self::AnchorCertificateHash(slot, hash) => {
                dest.iowrite_with(OPCODE_ANCHOR_HASH, scroll::BE)?;
                dest.iowrite_with(*slot as u32, scroll::BE)?;
                write_data(dest, hash)?;
            }
            Self::CertificateField(slot, field, m) => {
                dest.iowrite_with(OPCODE_CERT_FIELD, scroll::BE)?;
                dest.iowrite_with(*slot as u32, scroll::BE)?;
                write_data(dest, field.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateGeneric(slot, oid, m) => {
                dest.iowrite_with(OPCODE_CERT_GENERIC, scroll::BE)?;
                dest.iowrite_with(*slot as u32, scroll::BE)?;
                write_data(dest, oid)?;
                m.write_to(dest)?;
            }
            Self::AppleGenericAnchor => {
                dest.iowrite_with(OPCODE_APPLE_GENERIC_ANCHOR, scroll::BE)?;
            }
        }

        Ok(())
    }

    pub fn to_owned(&self) -> CodeRequirementExpression<'static> {
        match self {
            Self::And(a, b) => CodeRequirementExpression::And(
                Box::new((**a).to_owned()),
                Box::new((**b).to_owned()),
            ),
            Self::Identifier(value) => {
                CodeRequirementExpression::Identifier(Cow::Owned(value.to_string()))
            }
            Self::AnchorCertificateHash(slot, hash) => CodeRequirementExpression::AnchorCertificateHash(
                *slot,
                Cow::Owned(hash.to_vec()),
            ),
            Self::CertificateField(slot, field, m) => CodeRequirementExpression::CertificateField(
                *slot,
                Cow::Owned(field.to_string()),
                m.clone().into_owned(),
            ),
            Self::CertificateGeneric(slot, oid, m) => CodeRequirementExpression::CertificateGeneric(
                *slot,
                Cow::Owned(oid.to_vec()),
                m.clone().into_owned(),
            ),
            Self::AppleGenericAnchor => CodeRequirementExpression::AppleGenericAnchor,
        }
    }
}

impl<'a> CodeRequirementMatchExpression<'a> {
    fn into_owned(self) -> CodeRequirementMatchExpression<'static> {
        match self {
            Self::Exists => CodeRequirementMatchExpression::Exists,
            Self::Equal(value) => {
                CodeRequirementMatchExpression::Equal(Cow::Owned(value.into_owned()))
            }
        }
    }
}

fn format_cert_slot(slot: i32, f: &mut Formatter<'_>) -> std::fmt::Result {
    match slot {
        0 => f.write_str("leaf"),
        -1 => f.write_str("root"),
        _ => write!(f, "{}", slot),
    }
}

/// Render a DER-encoded OID in dotted decimal.
fn format_oid(oid: &[u8], f: &mut Formatter<'_>) -> std::fmt::Result {
    let mut arcs = Vec::new();
    let mut arc: u64 = 0;

    for byte in oid {
        arc = (arc << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            arcs.push(arc);
            arc = 0;
        }
    }

    for (i, arc) in arcs.iter().enumerate() {
        if i == 0 {
            write!(f, "{}.{}", arc / 40, arc % 40)?;
        } else {
            write!(f, ".{}", arc)?;
        }
    }

    Ok(())
}

impl<'a> Display for CodeRequirementExpression<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::And(a, b) => write!(f, "{} and {}", a, b),
            Self::Identifier(value) => write!(f, "identifier \"{}\"", value),
            Self::AnchorCertificateHash(slot, hash) => {
                f.write_str("certificate ")?;
                format_cert_slot(*slot, f)?;
                write!(f, " = H\"{}\"", hex::encode(hash))
            }
            Self::CertificateField(slot, field, m) => {
                f.write_str("certificate ")?;
                format_cert_slot(*slot, f)?;
                write!(f, "[{}] {}", field, m)
            }
            Self::CertificateGeneric(slot, oid, m) => {
                f.write_str("certificate ")?;
                format_cert_slot(*slot, f)?;
                f.write_str("[field.")?;
                format_oid(oid, f)?;
                write!(f, "] {}", m)
            }
            Self::AppleGenericAnchor => f.write_str("anchor apple generic"),
        }
    }
}

/// An ordered collection of requirement expressions, as stored in a
/// requirement blob.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CodeRequirements<'a>(pub Vec<CodeRequirementExpression<'a>>);

impl<'a> CodeRequirements<'a> {
    pub fn push(&mut self, expr: CodeRequirementExpression<'a>) {
        self.0.push(expr);
    }

    /// Parse a requirement blob payload: a `u32` expression count followed by
    /// that many serialized expressions. Returns remaining data.
    pub fn parse_binary(data: &'a [u8]) -> Result<(Self, &'a [u8]), SigningError> {
        let offset = &mut 0usize;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        let mut expressions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            expressions.push(CodeRequirementExpression::from_bytes(data, offset)?);
        }

        Ok((Self(expressions), &data[*offset..]))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SigningError> {
        let mut res = Vec::new();
        res.iowrite_with(self.0.len() as u32, scroll::BE)?;
        for expr in &self.0 {
            expr.write_to(&mut res)?;
        }

        Ok(res)
    }

    /// Produce a requirement blob holding these expressions.
    pub fn to_requirement_blob(&self) -> Result<RequirementBlob<'static>, SigningError> {
        let data = self.to_bytes()?;
        let blob = RequirementBlob { data: data.into() };

        // Normalize through a serialize/parse cycle so the result owns its
        // storage with the exact wire bytes.
        let serialized = blob.to_blob_bytes()?;
        Ok(RequirementBlob::from_blob_bytes(&serialized)?.to_owned())
    }
}

impl<'a> Display for CodeRequirements<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, expr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            Display::fmt(expr, f)?;
        }

        Ok(())
    }
}

/// Build the canonical designated requirement for an identifier signed by a
/// developer certificate with the given subject common name:
///
/// `identifier "<ident>" and anchor apple generic and
///  certificate leaf[subject.CN] = "<cn>" and
///  certificate 1[field.1.2.840.113635.100.6.2.1] /* exists */`
pub fn designated_requirement(ident: &str, certificate_cn: &str) -> CodeRequirementExpression<'static> {
    CodeRequirementExpression::And(
        Box::new(CodeRequirementExpression::Identifier(Cow::Owned(
            ident.to_string(),
        ))),
        Box::new(CodeRequirementExpression::And(
            Box::new(CodeRequirementExpression::AppleGenericAnchor),
            Box::new(CodeRequirementExpression::And(
                Box::new(CodeRequirementExpression::CertificateField(
                    0,
                    "subject.CN".into(),
                    CodeRequirementMatchExpression::Equal(Cow::Owned(certificate_cn.to_string())),
                )),
                Box::new(CodeRequirementExpression::CertificateGeneric(
                    1,
                    APPLE_WWDR_INTERMEDIATE_OID.into(),
                    CodeRequirementMatchExpression::Exists,
                )),
            )),
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_padding_to_four_bytes() {
        let mut dest = Vec::new();
        write_data(&mut dest, b"abcde").unwrap();
        assert_eq!(dest.len(), 4 + 8);
        assert_eq!(&dest[..4], &5u32.to_be_bytes());
        assert_eq!(&dest[9..12], &[0, 0, 0]);

        let offset = &mut 0usize;
        assert_eq!(read_data(&dest, offset).unwrap(), b"abcde");
        assert_eq!(*offset, 12);

        let mut dest = Vec::new();
        write_data(&mut dest, b"abcd").unwrap();
        assert_eq!(dest.len(), 8);
    }

    #[test]
    fn designated_requirement_round_trip() {
        let expr = designated_requirement("com.example.app", "Apple Development: Test Signer");
        let mut requirements = CodeRequirements::default();
        requirements.push(expr);

        let data = requirements.to_bytes().unwrap();
        assert_eq!(&data[..4], &1u32.to_be_bytes());
        assert_eq!(&data[4..8], &OPCODE_AND.to_be_bytes());

        let (parsed, remaining) = CodeRequirements::parse_binary(&data).unwrap();
        assert!(remaining.is_empty());
        assert_eq!(parsed, requirements);
        assert_eq!(parsed.to_bytes().unwrap(), data);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut data = 1u32.to_be_bytes().to_vec();
        data.extend_from_slice(&999u32.to_be_bytes());

        assert!(matches!(
            CodeRequirements::parse_binary(&data),
            Err(SigningError::RequirementUnknownOpcode(999))
        ));
    }

    #[test]
    fn display_renders_requirement_syntax() {
        let expr = designated_requirement("com.example.app", "Test CN");

        assert_eq!(
            expr.to_string(),
            "identifier \"com.example.app\" and anchor apple generic and \
             certificate leaf[subject.CN] = \"Test CN\" and \
             certificate 1[field.1.2.840.113635.100.6.2.1] /* exists */"
        );
    }

    #[test]
    fn requirement_blob_embeds_expression_count() {
        let mut requirements = CodeRequirements::default();
        requirements.push(CodeRequirementExpression::AppleGenericAnchor);

        let blob = requirements.to_requirement_blob().unwrap();
        let parsed = blob.parse_expressions().unwrap();
        assert_eq!(parsed.0, requirements.0);
    }
}
