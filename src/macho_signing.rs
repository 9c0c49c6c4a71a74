// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing orchestration.
//!
//! Ties the layers together: resolve the signing identity from a
//! provisioning profile, seal the bundle's resources, then construct the
//! embedded signature superblob for each Mach-O image and patch it into the
//! space the unsigned build reserved at the tail of `__LINKEDIT`.
//!
//! The superblob is built twice. CMS `SignedData` length cannot be known
//! before signing, so pass 1 signs a code directory holding placeholder page
//! digests purely to measure the finished superblob. The measured length is
//! checked against the reserved region, then pass 2 rebuilds everything with
//! real digests. Both passes must serialize to the same length.

use {
    crate::{
        binary_io::WriteCursor,
        bundle::{Bundle, FileProvider},
        certificate::{CertificateResolver, SigningCertificate},
        code_directory::CodeDirectoryBlob,
        code_hash::compute_code_hashes,
        code_requirement::{
            designated_requirement, CodeRequirementExpression, CodeRequirementMatchExpression,
            CodeRequirements,
        },
        code_resources::CodeResourcesBuilder,
        embedded_signature::{
            create_superblob, Blob, BlobWrapperBlob, CodeSigningMagic, CodeSigningSlot, Digest,
            DigestType, EmbeddedSignature, EntitlementsBlob, RequirementSetBlob, RequirementType,
        },
        error::SigningError,
        macho::MachObjectFile,
        provisioning::ProvisioningProfile,
        universal::FatBinary,
    },
    bcder::{Captured, Mode, OctetString, Oid},
    cryptographic_message_syntax::{Bytes, SignedDataBuilder, SignerBuilder},
    log::{debug, info, warn},
    scroll::Pread,
    x509_certificate::rfc5652::AttributeValue,
};

/// OID 1.2.840.113635.100.9.1: the `cdhashes` plist signed attribute.
const CDHASHES_PLIST_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x09, 0x01];

/// Caller-supplied knobs for a signing run.
#[derive(Clone, Debug, Default)]
pub struct SigningConfig {
    /// Sign as this identifier instead of the bundle's CFBundleIdentifier.
    pub bundle_id_override: Option<String>,
    /// Team identifier to record in the code directory, overriding the
    /// certificate's organizational unit.
    pub team_id_override: Option<String>,
    /// XML plist whose keys win over profile-derived entitlements.
    pub entitlements_override_xml: Option<String>,
    /// Re-use the designated requirement from the binary's existing
    /// signature instead of deriving one from the certificate.
    pub preserve_requirements: bool,
}

/// Everything needed to sign one Mach-O image, assembled during prepare.
pub struct SignatureContext<'a> {
    pub certificate: &'a SigningCertificate,
    pub ident: String,
    pub team_id: Option<String>,
    pub entitlements_xml: String,
    pub info_plist_data: Vec<u8>,
    pub code_resources_data: Vec<u8>,
    pub preserve_requirements: bool,
}

enum SigningState<'a> {
    Unprepared,
    Prepared(SignatureContext<'a>),
    Signed,
    Failed,
}

/// Drives a bundle through the signing state machine:
/// `Unprepared → Prepared → Signed`, with `Failed` terminal at any stage.
/// A failed signer never writes a partial executable back to the bundle.
pub struct BundleSigner<'a, P: FileProvider, R: CertificateResolver> {
    bundle: Bundle<P>,
    profile: ProvisioningProfile,
    resolver: &'a R,
    config: SigningConfig,
    state: SigningState<'a>,
}

impl<'a, P: FileProvider, R: CertificateResolver> BundleSigner<'a, P, R> {
    pub fn new(
        bundle: Bundle<P>,
        profile: ProvisioningProfile,
        resolver: &'a R,
        config: SigningConfig,
    ) -> Self {
        Self {
            bundle,
            profile,
            resolver,
            config,
            state: SigningState::Unprepared,
        }
    }

    pub fn into_bundle(self) -> Bundle<P> {
        self.bundle
    }

    /// Resolve identity and entitlements, seal resources, re-embed the
    /// provisioning profile. Transitions `Unprepared → Prepared`.
    pub fn prepare(&mut self) -> Result<(), SigningError> {
        if !matches!(self.state, SigningState::Unprepared) {
            return Err(SigningError::InvalidSigningState(
                "prepare requires the unprepared state",
            ));
        }

        match self.prepare_inner() {
            Ok(context) => {
                self.state = SigningState::Prepared(context);
                Ok(())
            }
            Err(e) => {
                self.state = SigningState::Failed;
                Err(e)
            }
        }
    }

    fn prepare_inner(&mut self) -> Result<SignatureContext<'a>, SigningError> {
        if self.profile.is_expired_at(std::time::SystemTime::now()) {
            warn!("provisioning profile is expired; proceeding anyway");
        }

        if let Some(bundle_id) = &self.config.bundle_id_override {
            self.bundle.set_info_plist_key(
                "CFBundleIdentifier",
                plist::Value::String(bundle_id.clone()),
            );
        }
        let ident = self.bundle.bundle_identifier()?.to_string();
        let executable = self.bundle.main_executable_name()?.to_string();
        info!("signing {} (executable {})", ident, executable);

        if !self.profile.covers_bundle_id(&ident)? {
            return Err(SigningError::ProfileBundleIdMismatch {
                profile: self.profile.application_identifier()?.to_string(),
                bundle: ident,
            });
        }

        let serials = self.profile.developer_certificate_serials()?;
        let resolver: &'a R = self.resolver;
        let certificate = resolver
            .resolve_by_serials(&serials)?
            .ok_or_else(|| {
                SigningError::CertificateNotFound(format!(
                    "no loaded certificate matches the {} certificate(s) named by profile {}",
                    serials.len(),
                    self.profile.name().unwrap_or("<unnamed>")
                ))
            })?;
        if !certificate.valid_at(chrono::Utc::now()) {
            return Err(SigningError::CertificateNotFound(format!(
                "certificate \"{}\" is outside its validity window",
                certificate.common_name()?
            )));
        }
        debug!("signing with certificate {}", certificate.common_name()?);

        let team_id = self
            .config
            .team_id_override
            .clone()
            .or_else(|| certificate.team_id())
            .or_else(|| self.profile.team_identifier().map(|t| t.to_string()));

        let overrides = match &self.config.entitlements_override_xml {
            Some(xml) => Some(
                plist::Value::from_reader_xml(xml.as_bytes())
                    .map_err(SigningError::PlistParseXml)?
                    .into_dictionary()
                    .ok_or(SigningError::EntitlementsOverrideNotDictionary)?,
            ),
            None => None,
        };
        let entitlements = self.profile.merged_entitlements(overrides.as_ref())?;
        let mut entitlements_xml = Vec::new();
        plist::Value::Dictionary(entitlements)
            .to_writer_xml(&mut entitlements_xml)
            .map_err(SigningError::PlistSerializeXml)?;
        let entitlements_xml = String::from_utf8(entitlements_xml)
            .map_err(|e| SigningError::EntitlementsBadUtf8(e.utf8_error()))?;

        self.bundle.embed_provisioning_profile(&self.profile.raw.clone())?;
        let info_plist_data = self.bundle.flush_info_plist()?;

        let code_resources_data = CodeResourcesBuilder::new_with_default_rules()
            .write_to_bundle(&mut self.bundle.provider, &executable)?;

        Ok(SignatureContext {
            certificate,
            ident,
            team_id,
            entitlements_xml,
            info_plist_data,
            code_resources_data,
            preserve_requirements: self.config.preserve_requirements,
        })
    }

    /// Sign the main executable and write it back. Transitions
    /// `Prepared → Signed`.
    pub fn sign(&mut self) -> Result<(), SigningError> {
        let context = match std::mem::replace(&mut self.state, SigningState::Failed) {
            SigningState::Prepared(context) => context,
            _ => {
                return Err(SigningError::InvalidSigningState(
                    "sign requires the prepared state",
                ));
            }
        };

        let executable = self.bundle.main_executable_name()?.to_string();
        let data = self.bundle.provider.read_file(&executable)?;

        let signed = sign_binary(&data, &context)?;
        self.bundle.provider.write_file(&executable, &signed)?;

        self.state = SigningState::Signed;
        Ok(())
    }
}

/// Sign a binary, fat or thin. Fat members are signed individually and
/// spliced back into their reserved extents, leaving the outer header and
/// member placement untouched.
pub fn sign_binary(data: &[u8], context: &SignatureContext) -> Result<Vec<u8>, SigningError> {
    let fat = FatBinary::parse(data)?;

    if !fat.is_fat() {
        return sign_thin(data, context);
    }

    let mut output = data.to_vec();
    for member in &fat.members {
        let arch = member
            .arch
            .ok_or(SigningError::InvalidBinary("fat member missing arch entry"))?;
        let start = arch.offset as usize;
        let end = start + arch.size as usize;
        let slice = data
            .get(start..end)
            .ok_or(SigningError::InputTruncated("fat member"))?;

        debug!("signing fat member cpu_type=0x{:x}", arch.cpu_type);
        let signed = sign_thin(slice, context)?;
        if signed.len() != slice.len() {
            return Err(SigningError::InvalidBinary(
                "signed fat member changed length",
            ));
        }
        output[start..end].copy_from_slice(&signed);
    }

    Ok(output)
}

/// Sign a single thin Mach-O image.
pub fn sign_thin(data: &[u8], context: &SignatureContext) -> Result<Vec<u8>, SigningError> {
    sign_thin_with(data, context, &create_cms_signature)
}

/// Like [`sign_thin`], but with the CMS step pluggable so callers can
/// substitute the signature producer.
fn sign_thin_with(
    data: &[u8],
    context: &SignatureContext,
    sign_fn: &dyn Fn(&SigningCertificate, &[u8]) -> Result<Vec<u8>, SigningError>,
) -> Result<Vec<u8>, SigningError> {
    let mut cursor = crate::binary_io::ReadCursor::new(data, scroll::LE);
    let image = MachObjectFile::parse(&mut cursor)?;

    let (sig_offset, sig_size) = image.signature_region()?;
    let code_limit = u32::try_from(sig_offset)
        .map_err(|_| SigningError::SignatureBuilder("code limit exceeds 4 GiB"))?;
    debug!(
        "signature region: offset 0x{:x}, {} bytes reserved",
        sig_offset, sig_size
    );

    let requirement_set = build_requirement_set(data, sig_offset, sig_size, context)?;
    let requirement_set_data = requirement_set.to_blob_bytes()?;
    let entitlements = EntitlementsBlob::from_string(&context.entitlements_xml);
    let entitlements_data = entitlements.to_blob_bytes()?;

    let mut code_directory = CodeDirectoryBlob::new(context.ident.clone(), code_limit);
    if let Some(team_id) = &context.team_id {
        code_directory.set_team_name(team_id.clone());
    }
    code_directory.set_special_digest(
        CodeSigningSlot::Info,
        Digest::from(DigestType::Sha1.digest_data(&context.info_plist_data)),
    );
    code_directory.set_special_digest(
        CodeSigningSlot::RequirementSet,
        Digest::from(DigestType::Sha1.digest_data(&requirement_set_data)),
    );
    code_directory.set_special_digest(
        CodeSigningSlot::ResourceDir,
        Digest::from(DigestType::Sha1.digest_data(&context.code_resources_data)),
    );
    code_directory.set_special_digest(
        CodeSigningSlot::Entitlements,
        Digest::from(DigestType::Sha1.digest_data(&entitlements_data)),
    );

    // Pass 1: placeholder page digests, real CMS run, to learn the exact
    // superblob length.
    let hash_len = code_directory.digest_type.hash_len();
    let slot_count =
        crate::code_directory::code_slot_count(code_limit, code_directory.page_size_log2);
    code_directory.code_digests = (0..slot_count)
        .map(|_| Digest::from(vec![0u8; hash_len]))
        .collect();

    let pass1_len = assemble_superblob(
        &code_directory,
        &requirement_set_data,
        &entitlements_data,
        context.certificate,
        sign_fn,
    )?
    .len();

    if pass1_len as u64 > sig_size {
        return Err(SigningError::SignatureDataTooLarge);
    }

    // Pass 2: real page digests over the final bytes, which for the hashed
    // range are identical to the input.
    code_directory.code_digests = compute_code_hashes(
        data,
        code_limit as usize,
        code_directory.digest_type,
        code_directory.page_size_log2,
    )?;

    let mut superblob = assemble_superblob(
        &code_directory,
        &requirement_set_data,
        &entitlements_data,
        context.certificate,
        sign_fn,
    )?;

    if superblob.len() != pass1_len {
        return Err(SigningError::SignaturePassLengthMismatch);
    }
    superblob.resize(sig_size as usize, 0);

    // Patch the superblob into the reserved region and drop anything past
    // __LINKEDIT's end.
    let mut output = data.to_vec();
    output.resize((sig_offset + sig_size) as usize, 0);
    let mut patcher = WriteCursor::with_buffer(output, 0, image.endian);
    patcher.push_position_and_jump(sig_offset);
    patcher.write_bytes(&superblob)?;
    patcher.pop_position()?;

    info!(
        "signed image: {} byte superblob in {} reserved bytes",
        pass1_len, sig_size
    );

    Ok(patcher.into_inner())
}

/// Designated requirement for this signing run: preserved from the existing
/// signature when requested (and compatible), otherwise derived from the
/// identifier and certificate.
fn build_requirement_set(
    data: &[u8],
    sig_offset: u64,
    sig_size: u64,
    context: &SignatureContext,
) -> Result<RequirementSetBlob<'static>, SigningError> {
    let certificate_cn = context.certificate.common_name()?;

    if context.preserve_requirements {
        if let Some(existing) = existing_requirement_set(data, sig_offset, sig_size)? {
            if let Some(requirement) = existing.requirement(RequirementType::Designated) {
                let expressions = requirement.parse_expressions()?;
                if let Some(existing_cn) = expressions.0.iter().find_map(designated_common_name) {
                    if existing_cn != certificate_cn {
                        return Err(SigningError::RequirementPreserveConflict {
                            existing: existing_cn.to_string(),
                            new: certificate_cn,
                        });
                    }
                }

                debug!("preserving existing designated requirement");
                return Ok(existing.to_owned());
            }
        }

        warn!("no existing requirement to preserve; deriving one");
    }

    let mut requirements = CodeRequirements::default();
    requirements.push(designated_requirement(&context.ident, &certificate_cn));

    let mut set = RequirementSetBlob::default();
    set.set_requirement(
        RequirementType::Designated,
        requirements.to_requirement_blob()?,
    );

    Ok(set)
}

/// Parse the requirement set out of an existing embedded signature, if the
/// reserved region holds one.
fn existing_requirement_set(
    data: &[u8],
    sig_offset: u64,
    sig_size: u64,
) -> Result<Option<RequirementSetBlob<'static>>, SigningError> {
    let region = match data.get(sig_offset as usize..(sig_offset + sig_size) as usize) {
        Some(region) => region,
        None => return Ok(None),
    };

    if region.pread_with::<u32>(0, scroll::BE)? != u32::from(CodeSigningMagic::EmbeddedSignature) {
        return Ok(None);
    }

    let signature = EmbeddedSignature::from_bytes(region)?;
    Ok(signature.requirement_set()?.map(|set| (*set).to_owned()))
}

/// The subject common name a designated requirement binds to, if any.
fn designated_common_name<'b>(expr: &'b CodeRequirementExpression) -> Option<&'b str> {
    match expr {
        CodeRequirementExpression::And(a, b) => {
            designated_common_name(a).or_else(|| designated_common_name(b))
        }
        CodeRequirementExpression::CertificateField(
            0,
            field,
            CodeRequirementMatchExpression::Equal(value),
        ) if field.as_ref() == "subject.CN" => Some(value),
        _ => None,
    }
}

/// Serialize the code directory, sign it with CMS, and assemble the
/// superblob in slot order.
fn assemble_superblob(
    code_directory: &CodeDirectoryBlob,
    requirement_set_data: &[u8],
    entitlements_data: &[u8],
    certificate: &SigningCertificate,
    sign_fn: &dyn Fn(&SigningCertificate, &[u8]) -> Result<Vec<u8>, SigningError>,
) -> Result<Vec<u8>, SigningError> {
    let code_directory_data = code_directory.to_blob_bytes()?;

    let cms = sign_fn(certificate, &code_directory_data)?;
    let wrapper = BlobWrapperBlob::from_data_owned(cms);

    let blobs = vec![
        (CodeSigningSlot::CodeDirectory, code_directory_data),
        (
            CodeSigningSlot::RequirementSet,
            requirement_set_data.to_vec(),
        ),
        (CodeSigningSlot::Entitlements, entitlements_data.to_vec()),
        (CodeSigningSlot::Signature, wrapper.to_blob_bytes()?),
    ];

    create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter())
}

/// CMS `SignedData` over the code directory, with the `cdhashes` plist
/// bound in as a signed attribute alongside message-digest and signing-time.
pub fn create_cms_signature(
    certificate: &SigningCertificate,
    code_directory_data: &[u8],
) -> Result<Vec<u8>, SigningError> {
    let cdhash_sha1 = DigestType::Sha1.digest_data(code_directory_data);
    let cdhash_sha256 = DigestType::Sha256.digest_data(code_directory_data);
    let cdhash_plist = build_cdhash_plist(&cdhash_sha1, &cdhash_sha256)?;

    let attribute_value = AttributeValue::new(Captured::from_values(
        Mode::Der,
        OctetString::encode_slice(cdhash_plist),
    ));

    let signer = SignerBuilder::new(&certificate.signing_key, certificate.certificate.clone())
        .signed_attribute(
            Oid(Bytes::copy_from_slice(CDHASHES_PLIST_OID)),
            vec![attribute_value],
        );

    let mut builder = SignedDataBuilder::default()
        .content_external(code_directory_data.to_vec())
        .signer(signer);
    for cert in &certificate.chain {
        builder = builder.certificate(cert.clone());
    }

    Ok(builder.build_der()?)
}

/// XML plist `{"cdhashes": [sha1, sha256[..20]]}`; both entries are 20
/// bytes, the SHA-256 digest truncated to the SHA-1 length.
fn build_cdhash_plist(sha1: &[u8], sha256: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut dict = plist::Dictionary::new();
    dict.insert(
        "cdhashes".to_string(),
        plist::Value::Array(vec![
            plist::Value::Data(sha1.to_vec()),
            plist::Value::Data(sha256[..20].to_vec()),
        ]),
    );

    let mut data = Vec::new();
    plist::Value::Dictionary(dict)
        .to_writer_xml(&mut data)
        .map_err(SigningError::PlistSerializeXml)?;
    data.push(b'\n');

    Ok(data)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            bundle::testutil::{make_info_plist, MemoryFileProvider},
            certificate::InMemoryCertificateStore,
            macho::testutil as macho_testutil,
            provisioning::testutil as profile_testutil,
            testcredentials,
        },
    };

    const RESERVED: u32 = 0x10000;

    fn make_signer_inputs(
        reserved: u32,
    ) -> (
        Bundle<MemoryFileProvider>,
        ProvisioningProfile,
        InMemoryCertificateStore,
    ) {
        let cert = testcredentials::signing_certificate();
        let der = cert.certificate.encode_der().unwrap();

        let mut provider = MemoryFileProvider::default();
        provider
            .write_file("Info.plist", &make_info_plist("com.example.App", "App"))
            .unwrap();
        provider
            .write_file("App", &macho_testutil::synthesize_stub(reserved))
            .unwrap();
        provider.write_file("Assets.car", b"assets").unwrap();

        let profile_data =
            profile_testutil::synthesize_profile("com.example.App", "TESTTEAM12", vec![der]);
        let profile = ProvisioningProfile::from_bytes(&profile_data).unwrap();

        let mut store = InMemoryCertificateStore::default();
        store.add(cert);

        (Bundle::open(provider).unwrap(), profile, store)
    }

    #[test]
    fn end_to_end_sign_stub_bundle() {
        let (bundle, profile, store) = make_signer_inputs(RESERVED);
        let mut signer = BundleSigner::new(bundle, profile, &store, SigningConfig::default());

        signer.prepare().unwrap();
        signer.sign().unwrap();

        let bundle = signer.into_bundle();
        let signed = bundle.provider.read_file("App").unwrap();

        let sig_offset =
            (macho_testutil::LINKEDIT_OFFSET + macho_testutil::PRE_SIGNATURE_LINKEDIT) as usize;

        // Output ends exactly at __LINKEDIT's end and the superblob magic
        // sits at the recorded signature offset.
        assert_eq!(signed.len(), sig_offset + RESERVED as usize);
        assert_eq!(
            u32::from_be_bytes(signed[sig_offset..sig_offset + 4].try_into().unwrap()),
            0xfade0cc0
        );

        let signature = EmbeddedSignature::from_bytes(&signed[sig_offset..]).unwrap();
        let cd = signature.code_directory().unwrap().unwrap();
        assert_eq!(cd.ident, "com.example.App");
        assert_eq!(cd.team_name.as_deref(), Some("TESTTEAM12"));
        assert_eq!(cd.code_limit as usize, sig_offset);
        assert_eq!(
            cd.code_digests.len() as u32,
            crate::code_directory::code_slot_count(sig_offset as u32, 12)
        );

        // Page digests cover the pre-signature bytes.
        let expected =
            compute_code_hashes(&signed, sig_offset, DigestType::Sha1, 12).unwrap();
        assert_eq!(cd.code_digests, expected);

        // The requirement set binds the identifier and certificate CN.
        let set = signature.requirement_set().unwrap().unwrap();
        let designated = set.requirement(RequirementType::Designated).unwrap();
        let rendered = designated.parse_expressions().unwrap().to_string();
        assert!(rendered.contains("identifier \"com.example.App\""));
        assert!(rendered.contains("Apple Development: Test Signer"));

        assert!(signature.signature_data().unwrap().is_some());

        // Ancillary bundle outputs were produced during prepare.
        assert!(bundle
            .provider
            .files
            .contains_key("_CodeSignature/CodeResources"));
        assert!(bundle.provider.files.contains_key("embedded.mobileprovision"));
    }

    #[test]
    fn oversized_signature_fails_without_output() {
        let (bundle, profile, store) = make_signer_inputs(0x200);
        let original = bundle.provider.read_file("App").unwrap();
        let mut signer = BundleSigner::new(bundle, profile, &store, SigningConfig::default());

        signer.prepare().unwrap();
        assert!(matches!(
            signer.sign(),
            Err(SigningError::SignatureDataTooLarge)
        ));

        // Failed is terminal and the executable is untouched.
        assert!(matches!(
            signer.sign(),
            Err(SigningError::InvalidSigningState(_))
        ));
        assert_eq!(
            signer.into_bundle().provider.read_file("App").unwrap(),
            original
        );
    }

    #[test]
    fn sign_requires_prepare_first() {
        let (bundle, profile, store) = make_signer_inputs(RESERVED);
        let mut signer = BundleSigner::new(bundle, profile, &store, SigningConfig::default());

        assert!(matches!(
            signer.sign(),
            Err(SigningError::InvalidSigningState(_))
        ));
    }

    #[test]
    fn profile_for_other_bundle_is_rejected() {
        let cert = testcredentials::signing_certificate();
        let der = cert.certificate.encode_der().unwrap();

        let mut provider = MemoryFileProvider::default();
        provider
            .write_file("Info.plist", &make_info_plist("com.example.App", "App"))
            .unwrap();
        provider
            .write_file("App", &macho_testutil::synthesize_stub(RESERVED))
            .unwrap();

        let profile_data =
            profile_testutil::synthesize_profile("com.somebody.Else", "OTHERTEAM99", vec![der]);
        let profile = ProvisioningProfile::from_bytes(&profile_data).unwrap();

        let mut store = InMemoryCertificateStore::default();
        store.add(cert);

        let bundle = Bundle::open(provider).unwrap();
        let mut signer = BundleSigner::new(bundle, profile, &store, SigningConfig::default());

        match signer.prepare() {
            Err(SigningError::ProfileBundleIdMismatch { profile, bundle }) => {
                assert_eq!(profile, "OTHERTEAM99.com.somebody.Else");
                assert_eq!(bundle, "com.example.App");
            }
            other => panic!("expected profile mismatch, got {:?}", other),
        }

        // Failure during prepare is terminal.
        assert!(matches!(
            signer.sign(),
            Err(SigningError::InvalidSigningState(_))
        ));
    }

    #[test]
    fn missing_certificate_is_distinct_error() {
        let (bundle, profile, _) = make_signer_inputs(RESERVED);
        let empty = InMemoryCertificateStore::default();
        let mut signer = BundleSigner::new(bundle, profile, &empty, SigningConfig::default());

        assert!(matches!(
            signer.prepare(),
            Err(SigningError::CertificateNotFound(_))
        ));
    }

    #[test]
    fn entitlement_override_lands_in_blob() {
        let (bundle, profile, store) = make_signer_inputs(RESERVED);
        let config = SigningConfig {
            entitlements_override_xml: Some(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>get-task-allow</key><false/>
</dict></plist>"#
                    .to_string(),
            ),
            ..Default::default()
        };
        let mut signer = BundleSigner::new(bundle, profile, &store, config);
        signer.prepare().unwrap();
        signer.sign().unwrap();

        let signed = signer.into_bundle().provider.read_file("App").unwrap();
        let sig_offset =
            (macho_testutil::LINKEDIT_OFFSET + macho_testutil::PRE_SIGNATURE_LINKEDIT) as usize;
        let signature = EmbeddedSignature::from_bytes(&signed[sig_offset..]).unwrap();

        let entry = signature
            .find_slot(CodeSigningSlot::Entitlements)
            .unwrap()
            .parse()
            .unwrap();
        let xml = match entry {
            crate::embedded_signature::BlobData::Entitlements(blob) => blob.as_str().to_string(),
            _ => panic!("wrong blob in entitlements slot"),
        };
        assert!(xml.contains("get-task-allow"));
        assert!(xml.contains("<false/>"));
        assert!(xml.contains("application-identifier"));
    }

    #[test]
    fn preserve_requirements_conflict_names_both_parties() {
        let mut requirements = CodeRequirements::default();
        requirements.push(designated_requirement("com.example.App", "Somebody Else"));
        let mut set = RequirementSetBlob::default();
        set.set_requirement(
            RequirementType::Designated,
            requirements.to_requirement_blob().unwrap(),
        );

        // Build a stub whose reserved region already holds a minimal
        // signature bound to a different common name.
        let mut data = macho_testutil::synthesize_stub(RESERVED);
        let sig_offset =
            (macho_testutil::LINKEDIT_OFFSET + macho_testutil::PRE_SIGNATURE_LINKEDIT) as usize;
        let blobs = vec![(
            CodeSigningSlot::RequirementSet,
            set.to_blob_bytes().unwrap(),
        )];
        let superblob = create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter()).unwrap();
        data[sig_offset..sig_offset + superblob.len()].copy_from_slice(&superblob);

        let cert = testcredentials::signing_certificate();
        let context = SignatureContext {
            certificate: &cert,
            ident: "com.example.App".to_string(),
            team_id: Some("TESTTEAM12".to_string()),
            entitlements_xml: "<plist/>".to_string(),
            info_plist_data: b"info".to_vec(),
            code_resources_data: b"resources".to_vec(),
            preserve_requirements: true,
        };

        match sign_thin(&data, &context) {
            Err(SigningError::RequirementPreserveConflict { existing, new }) => {
                assert_eq!(existing, "Somebody Else");
                assert_eq!(new, "Apple Development: Test Signer");
            }
            other => panic!("expected preserve conflict, got {:?}", other.map(|_| ())),
        }
    }

    fn make_thin_context(cert: &SigningCertificate) -> SignatureContext {
        SignatureContext {
            certificate: cert,
            ident: "com.example.App".to_string(),
            team_id: Some("TESTTEAM12".to_string()),
            entitlements_xml: "<plist/>".to_string(),
            info_plist_data: b"info".to_vec(),
            code_resources_data: b"resources".to_vec(),
            preserve_requirements: false,
        }
    }

    #[test]
    fn diverging_signature_length_between_passes_is_rejected() {
        let data = macho_testutil::synthesize_stub(RESERVED);
        let cert = testcredentials::signing_certificate();
        let context = make_thin_context(&cert);

        // A signature producer whose output grows on every call makes the
        // finalization pass serialize longer than the sizing pass.
        let calls = std::cell::Cell::new(0usize);
        let sign_fn = |_: &SigningCertificate, _: &[u8]| -> Result<Vec<u8>, SigningError> {
            let n = calls.get();
            calls.set(n + 1);
            Ok(vec![0u8; 64 + 8 * n])
        };

        match sign_thin_with(&data, &context, &sign_fn) {
            Err(SigningError::SignaturePassLengthMismatch) => {}
            other => panic!("expected pass length mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn signing_twice_reproduces_the_code_directory() {
        let data = macho_testutil::synthesize_stub(RESERVED);
        let cert = testcredentials::signing_certificate();
        let context = make_thin_context(&cert);

        let first = sign_thin(&data, &context).unwrap();
        let second = sign_thin(&first, &context).unwrap();

        let sig_offset =
            (macho_testutil::LINKEDIT_OFFSET + macho_testutil::PRE_SIGNATURE_LINKEDIT) as usize;
        assert_eq!(first.len(), second.len());
        assert_eq!(&first[..sig_offset], &second[..sig_offset]);

        // The hashed range is unchanged by re-signing, so the code
        // directories must serialize identically. The CMS bytes may differ
        // (signing time), so they are not compared.
        let cd1 = EmbeddedSignature::from_bytes(&first[sig_offset..])
            .unwrap()
            .code_directory()
            .unwrap()
            .unwrap();
        let cd2 = EmbeddedSignature::from_bytes(&second[sig_offset..])
            .unwrap()
            .code_directory()
            .unwrap()
            .unwrap();
        assert_eq!(
            cd1.to_blob_bytes().unwrap(),
            cd2.to_blob_bytes().unwrap()
        );
    }

    #[test]
    fn cdhash_plist_truncates_sha256() {
        let sha1 = vec![0x11u8; 20];
        let sha256 = vec![0x22u8; 32];
        let data = build_cdhash_plist(&sha1, &sha256).unwrap();

        let parsed: plist::Value = plist::from_bytes(&data).unwrap();
        let hashes = parsed
            .as_dictionary()
            .unwrap()
            .get("cdhashes")
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(hashes[0].as_data().unwrap(), sha1.as_slice());
        assert_eq!(hashes[1].as_data().unwrap(), &sha256[..20]);
    }
}
