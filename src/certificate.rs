// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing certificates and key material.

use {
    crate::error::SigningError,
    bcder::Oid,
    x509_certificate::{asn1time::Time, CapturedX509Certificate, InMemorySigningKeyPair},
};

/// A certificate paired with its private key, plus any intermediate
/// certificates to include in CMS signatures.
#[derive(Debug)]
pub struct SigningCertificate {
    pub certificate: CapturedX509Certificate,
    pub signing_key: InMemorySigningKeyPair,
    pub chain: Vec<CapturedX509Certificate>,
}

impl SigningCertificate {
    /// Construct from PEM-encoded certificate and PKCS#8 private key.
    ///
    /// The certificate PEM may hold multiple certificates; the first is
    /// taken as the signing certificate and the rest as its chain.
    pub fn from_pem_parts(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, SigningError> {
        let mut certificates = CapturedX509Certificate::from_pem_multiple(cert_pem)?;
        if certificates.is_empty() {
            return Err(SigningError::NoSigningCertificate);
        }
        let certificate = certificates.remove(0);

        let signing_key = InMemorySigningKeyPair::from_pkcs8_pem(key_pem)?;

        Ok(Self {
            certificate,
            signing_key,
            chain: certificates,
        })
    }

    /// Construct from PFX/PKCS#12 data, as exported from Keychain Access.
    pub fn from_pfx(data: &[u8], password: &str) -> Result<Self, SigningError> {
        let (certificate, signing_key) = parse_pfx_data(data, password)?;

        Ok(Self {
            certificate,
            signing_key,
            chain: vec![],
        })
    }

    /// Subject common name of the signing certificate.
    pub fn common_name(&self) -> Result<String, SigningError> {
        self.certificate
            .subject_common_name()
            .ok_or(SigningError::CertificateNoCommonName)
    }

    /// Team identifier, conventionally carried in the subject's first
    /// organizational unit attribute.
    pub fn team_id(&self) -> Option<String> {
        self.certificate
            .subject_name()
            .find_first_attribute_string(Oid(
                x509_certificate::rfc4519::OID_ORGANIZATIONAL_UNIT_NAME
                    .as_ref()
                    .into(),
            ))
            .unwrap_or(None)
    }

    /// Whether the certificate's validity window contains `at`.
    pub fn valid_at(&self, at: chrono::DateTime<chrono::Utc>) -> bool {
        let tbs = &AsRef::<x509_certificate::rfc5280::Certificate>::as_ref(&self.certificate)
            .tbs_certificate;

        time_to_chrono(&tbs.validity.not_before) <= at
            && at <= time_to_chrono(&tbs.validity.not_after)
    }

    /// DER serial number of the certificate.
    pub fn serial_number(&self) -> &bcder::Integer {
        self.certificate.serial_number_asn1()
    }
}

fn time_to_chrono(time: &Time) -> chrono::DateTime<chrono::Utc> {
    match time {
        Time::UtcTime(utc) => **utc,
        Time::GeneralTime(gt) => gt.clone().into(),
    }
}

/// Resolves the certificate to sign with.
///
/// Implementations may consult an in-memory collection, the filesystem, or
/// any other store. Returning `Ok(None)` means no candidate matched.
pub trait CertificateResolver {
    /// Find a certificate whose subject common name equals `common_name`.
    fn resolve_by_common_name(
        &self,
        common_name: &str,
    ) -> Result<Option<&SigningCertificate>, SigningError>;

    /// Find a certificate matching any of the given DER serial numbers,
    /// preferring one that is currently time-valid.
    fn resolve_by_serials(
        &self,
        serials: &[bcder::Integer],
    ) -> Result<Option<&SigningCertificate>, SigningError>;
}

/// Certificate store backed by loaded key pairs.
#[derive(Default)]
pub struct InMemoryCertificateStore {
    certificates: Vec<SigningCertificate>,
}

impl InMemoryCertificateStore {
    pub fn add(&mut self, certificate: SigningCertificate) {
        self.certificates.push(certificate);
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

impl CertificateResolver for InMemoryCertificateStore {
    fn resolve_by_common_name(
        &self,
        common_name: &str,
    ) -> Result<Option<&SigningCertificate>, SigningError> {
        for cert in &self.certificates {
            if cert.common_name()? == common_name {
                return Ok(Some(cert));
            }
        }

        Ok(None)
    }

    fn resolve_by_serials(
        &self,
        serials: &[bcder::Integer],
    ) -> Result<Option<&SigningCertificate>, SigningError> {
        let candidates = self
            .certificates
            .iter()
            .filter(|cert| serials.contains(cert.serial_number()))
            .collect::<Vec<_>>();

        let now = chrono::Utc::now();

        Ok(candidates
            .iter()
            .find(|cert| cert.valid_at(now))
            .or_else(|| candidates.first())
            .copied())
    }
}

fn bmp_string(s: &str) -> Vec<u8> {
    let utf16: Vec<u16> = s.encode_utf16().collect();

    let mut bytes = Vec::with_capacity(utf16.len() * 2 + 2);
    for c in utf16 {
        bytes.push((c / 256) as u8);
        bytes.push((c % 256) as u8);
    }
    bytes.push(0x00);
    bytes.push(0x00);

    bytes
}

/// Parse PFX data into a key pair.
///
/// PFX data is commonly encountered in `.p12` files, such as those created
/// when exporting certificates from Apple's `Keychain Access` application.
/// If no password was set when creating the PFX data, the password may be
/// the empty string.
pub fn parse_pfx_data(
    data: &[u8],
    password: &str,
) -> Result<(CapturedX509Certificate, InMemorySigningKeyPair), SigningError> {
    let pfx = p12::PFX::parse(data).map_err(|e| {
        SigningError::PfxParseError(format!("data does not appear to be PFX: {:?}", e))
    })?;

    if !pfx.verify_mac(password) {
        return Err(SigningError::PfxBadPassword);
    }

    // Keychain's export format is regular data content info with inner
    // ContentInfo components holding the key and certificate.
    let data = match pfx.auth_safe {
        p12::ContentInfo::Data(data) => data,
        _ => {
            return Err(SigningError::PfxParseError(
                "unexpected PFX content info".to_string(),
            ));
        }
    };

    let content_infos = yasna::parse_der(&data, |reader| {
        reader.collect_sequence_of(p12::ContentInfo::parse)
    })
    .map_err(|e| {
        SigningError::PfxParseError(format!("failed parsing inner ContentInfo: {:?}", e))
    })?;

    let bmp_password = bmp_string(password);

    let mut certificate = None;
    let mut signing_key = None;

    for content in content_infos {
        let bags_data = match content {
            p12::ContentInfo::Data(inner) => inner,
            p12::ContentInfo::EncryptedData(encrypted) => {
                encrypted.data(&bmp_password).ok_or_else(|| {
                    SigningError::PfxParseError(
                        "failed decrypting inner EncryptedData".to_string(),
                    )
                })?
            }
            p12::ContentInfo::OtherContext(_) => {
                return Err(SigningError::PfxParseError(
                    "unexpected OtherContent content in inner PFX data".to_string(),
                ));
            }
        };

        let bags = yasna::parse_ber(&bags_data, |reader| {
            reader.collect_sequence_of(p12::SafeBag::parse)
        })
        .map_err(|e| {
            SigningError::PfxParseError(format!(
                "failed parsing SafeBag within inner Data: {:?}",
                e
            ))
        })?;

        for bag in bags {
            match bag.bag {
                p12::SafeBagKind::CertBag(cert_bag) => match cert_bag {
                    p12::CertBag::X509(cert_data) => {
                        certificate = Some(CapturedX509Certificate::from_der(cert_data)?);
                    }
                    p12::CertBag::SDSI(_) => {
                        return Err(SigningError::PfxParseError(
                            "unexpected SDSI certificate data".to_string(),
                        ));
                    }
                },
                p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                    let decrypted = key_bag.decrypt(&bmp_password).ok_or_else(|| {
                        SigningError::PfxParseError(
                            "error decrypting PKCS8 shrouded key bag; is the password correct?"
                                .to_string(),
                        )
                    })?;

                    signing_key = Some(InMemorySigningKeyPair::from_pkcs8_der(&decrypted)?);
                }
                p12::SafeBagKind::OtherBagKind(_) => {
                    return Err(SigningError::PfxParseError(
                        "unexpected bag type in inner PFX content".to_string(),
                    ));
                }
            }
        }
    }

    match (certificate, signing_key) {
        (Some(certificate), Some(signing_key)) => Ok((certificate, signing_key)),
        (None, Some(_)) => Err(SigningError::PfxParseError(
            "failed to find x509 certificate in PFX data".to_string(),
        )),
        (_, None) => Err(SigningError::PfxParseError(
            "failed to find signing key in PFX data".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testcredentials};

    #[test]
    fn load_pem_credentials() {
        let cert = testcredentials::signing_certificate();

        assert_eq!(
            cert.common_name().unwrap(),
            "Apple Development: Test Signer"
        );
        assert_eq!(cert.team_id().as_deref(), Some("TESTTEAM12"));
        assert!(cert.valid_at(chrono::Utc::now()));
        assert!(cert.chain.is_empty());
    }

    #[test]
    fn bmp_string_is_utf16_be_with_terminator() {
        assert_eq!(bmp_string(""), vec![0, 0]);
        assert_eq!(bmp_string("ab"), vec![0, 0x61, 0, 0x62, 0, 0]);
    }

    #[test]
    fn resolver_matches_common_name_and_serial() {
        let mut store = InMemoryCertificateStore::default();
        store.add(testcredentials::signing_certificate());

        let resolved = store
            .resolve_by_common_name("Apple Development: Test Signer")
            .unwrap()
            .unwrap();
        let serial = resolved.serial_number().clone();

        assert!(store
            .resolve_by_common_name("Somebody Else")
            .unwrap()
            .is_none());
        assert!(store.resolve_by_serials(&[serial]).unwrap().is_some());
        assert!(store.resolve_by_serials(&[]).unwrap().is_none());
    }
}
