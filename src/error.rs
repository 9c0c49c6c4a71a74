// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    cryptographic_message_syntax::CmsError, thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Unified error type for binary re-signing.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument")]
    CliBadArgument,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("invalid Mach-O binary: {0}")]
    InvalidBinary(&'static str),

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("stream position mismatch: expected {expected}, actual {actual}")]
    StreamPosition { expected: u64, actual: u64 },

    #[error("attempted to restore a position that was never saved")]
    PositionStackEmpty,

    #[error("input data truncated while reading {0}")]
    InputTruncated(&'static str),

    #[error("unable to locate __LINKEDIT segment")]
    MissingLinkedit,

    #[error("multiple __LINKEDIT segments present")]
    MultipleLinkedit,

    #[error("binary does not have a code signature load command")]
    CodeSignatureCommandMissing,

    #[error("code signature region does not end at __LINKEDIT's end")]
    SignatureNotAtLinkeditEnd,

    #[error("SuperBlob data is malformed")]
    SuperblobMalformed,

    #[error("malformed identifier string in code directory")]
    CodeDirectoryMalformedIdentifier,

    #[error("malformed team name string in code directory")]
    CodeDirectoryMalformedTeam,

    #[error("unknown code requirement opcode: {0}")]
    RequirementUnknownOpcode(u32),

    #[error("unknown code requirement match expression: {0}")]
    RequirementUnknownMatchExpression(u32),

    #[error("code requirement data malformed: {0}")]
    RequirementMalformed(&'static str),

    #[error(
        "cannot preserve existing designated requirement bound to \"{existing}\" \
         while signing with certificate \"{new}\""
    )]
    RequirementPreserveConflict { existing: String, new: String },

    #[error("entitlements data not valid UTF-8: {0}")]
    EntitlementsBadUtf8(std::str::Utf8Error),

    #[error("entitlements override plist is not a dictionary")]
    EntitlementsOverrideNotDictionary,

    #[error("error parsing plist XML: {0}")]
    PlistParseXml(plist::Error),

    #[error("error serializing plist to XML: {0}")]
    PlistSerializeXml(plist::Error),

    #[error("bundle Info.plist does not define CFBundleIdentifier")]
    BundleNoIdentifier,

    #[error("bundle Info.plist does not define CFBundleExecutable")]
    BundleNoMainExecutable,

    #[error("provisioning profile is malformed: {0}")]
    ProvisioningProfileMalformed(&'static str),

    #[error(
        "provisioning profile application identifier \"{profile}\" does not \
         cover bundle \"{bundle}\""
    )]
    ProfileBundleIdMismatch { profile: String, bundle: String },

    #[error("failed to find certificate satisfying requirements: {0}")]
    CertificateNotFound(String),

    #[error("no signing certificate")]
    NoSigningCertificate,

    #[error("certificate does not carry a subject common name")]
    CertificateNoCommonName,

    #[error("incorrect password given when decrypting PFX data")]
    PfxBadPassword,

    #[error("error parsing PFX data: {0}")]
    PfxParseError(String),

    #[error("signature data too large for the reserved signature region")]
    SignatureDataTooLarge,

    #[error("signature size mismatch between sizing and finalization passes")]
    SignaturePassLengthMismatch,

    #[error("signature builder error: {0}")]
    SignatureBuilder(&'static str),

    #[error("signing operation invoked from invalid state: {0}")]
    InvalidSigningState(&'static str),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,
}
