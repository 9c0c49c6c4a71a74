// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mobile provisioning profiles.
//!
//! Profiles are XML plists wrapped in a CMS envelope. We do not verify the
//! envelope; the plist document is located by scanning for the `<?xml`
//! prologue and the closing `</plist>` tag, which holds for every profile
//! Apple issues.

use {
    crate::error::SigningError,
    x509_certificate::CapturedX509Certificate,
};

/// A parsed provisioning profile.
#[derive(Clone, Debug)]
pub struct ProvisioningProfile {
    /// Raw profile bytes, envelope included, for re-embedding.
    pub raw: Vec<u8>,
    plist: plist::Dictionary,
}

impl ProvisioningProfile {
    pub fn from_bytes(data: &[u8]) -> Result<Self, SigningError> {
        let start = find_subslice(data, b"<?xml")
            .ok_or(SigningError::ProvisioningProfileMalformed("no XML prologue"))?;
        let end_tag = b"</plist>";
        let end = find_subslice(&data[start..], end_tag)
            .ok_or(SigningError::ProvisioningProfileMalformed("no closing plist tag"))?
            + start
            + end_tag.len();

        let value = plist::Value::from_reader_xml(&data[start..end])
            .map_err(SigningError::PlistParseXml)?;
        let plist = value
            .into_dictionary()
            .ok_or(SigningError::ProvisioningProfileMalformed("root is not a dict"))?;

        Ok(Self {
            raw: data.to_vec(),
            plist,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.plist.get("Name").and_then(|v| v.as_string())
    }

    /// `application-identifier` from the profile's entitlements, with the
    /// team prefix intact.
    pub fn application_identifier(&self) -> Result<&str, SigningError> {
        self.entitlements()?
            .get("application-identifier")
            .and_then(|v| v.as_string())
            .ok_or(SigningError::ProvisioningProfileMalformed(
                "entitlements lack application-identifier",
            ))
    }

    /// Whether this profile authorizes signing `bundle_id`.
    ///
    /// The application identifier is the team prefix followed by an app id
    /// that may end in a `*` wildcard covering any suffix.
    pub fn covers_bundle_id(&self, bundle_id: &str) -> Result<bool, SigningError> {
        let app_id = self.application_identifier()?;
        let pattern = app_id
            .split_once('.')
            .map(|(_, rest)| rest)
            .unwrap_or(app_id);

        Ok(match pattern.strip_suffix('*') {
            Some(prefix) => bundle_id.starts_with(prefix),
            None => bundle_id == pattern,
        })
    }

    /// First team identifier prefix.
    pub fn team_identifier(&self) -> Option<&str> {
        self.plist
            .get("TeamIdentifier")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_string())
    }

    pub fn entitlements(&self) -> Result<&plist::Dictionary, SigningError> {
        self.plist
            .get("Entitlements")
            .and_then(|v| v.as_dictionary())
            .ok_or(SigningError::ProvisioningProfileMalformed("no Entitlements dict"))
    }

    /// Profile entitlements with overriding keys applied on top.
    pub fn merged_entitlements(
        &self,
        overrides: Option<&plist::Dictionary>,
    ) -> Result<plist::Dictionary, SigningError> {
        let mut merged = self.entitlements()?.clone();

        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }

        Ok(merged)
    }

    /// DER-encoded developer certificates authorized by this profile.
    pub fn developer_certificates(&self) -> Result<Vec<CapturedX509Certificate>, SigningError> {
        let entries = self
            .plist
            .get("DeveloperCertificates")
            .and_then(|v| v.as_array())
            .ok_or(SigningError::ProvisioningProfileMalformed(
                "no DeveloperCertificates array",
            ))?;

        entries
            .iter()
            .map(|v| {
                let data = v.as_data().ok_or(SigningError::ProvisioningProfileMalformed(
                    "developer certificate entry is not data",
                ))?;
                Ok(CapturedX509Certificate::from_der(data.to_vec())?)
            })
            .collect()
    }

    /// Serial numbers of the authorized developer certificates, used to pick
    /// a signing certificate from a store.
    pub fn developer_certificate_serials(&self) -> Result<Vec<bcder::Integer>, SigningError> {
        Ok(self
            .developer_certificates()?
            .iter()
            .map(|cert| cert.serial_number_asn1().clone())
            .collect())
    }

    pub fn expiration_date(&self) -> Option<plist::Date> {
        self.plist
            .get("ExpirationDate")
            .and_then(|v| v.as_date())
    }

    pub fn is_expired_at(&self, at: std::time::SystemTime) -> bool {
        match self.expiration_date() {
            Some(date) => std::time::SystemTime::from(date) < at,
            None => false,
        }
    }

    /// Whether the profile allows debuggers to attach.
    pub fn allows_task_debugging(&self) -> bool {
        self.entitlements()
            .ok()
            .and_then(|e| e.get("get-task-allow"))
            .and_then(|v| v.as_boolean())
            .unwrap_or(false)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Build an unsigned profile envelope: junk bytes around an XML plist,
    /// which is the shape `from_bytes` knows how to unwrap.
    pub fn synthesize_profile(
        app_id: &str,
        team_id: &str,
        certificates_der: Vec<Vec<u8>>,
    ) -> Vec<u8> {
        let mut entitlements = plist::Dictionary::new();
        entitlements.insert(
            "application-identifier".to_string(),
            plist::Value::String(format!("{}.{}", team_id, app_id)),
        );
        entitlements.insert(
            "com.apple.developer.team-identifier".to_string(),
            plist::Value::String(team_id.to_string()),
        );
        entitlements.insert("get-task-allow".to_string(), plist::Value::Boolean(true));

        let mut root = plist::Dictionary::new();
        root.insert(
            "Name".to_string(),
            plist::Value::String("Test Profile".to_string()),
        );
        root.insert(
            "TeamIdentifier".to_string(),
            plist::Value::Array(vec![plist::Value::String(team_id.to_string())]),
        );
        root.insert(
            "Entitlements".to_string(),
            plist::Value::Dictionary(entitlements),
        );
        root.insert(
            "DeveloperCertificates".to_string(),
            plist::Value::Array(certificates_der.into_iter().map(plist::Value::Data).collect()),
        );
        root.insert(
            "ExpirationDate".to_string(),
            plist::Value::Date(plist::Date::from(
                std::time::SystemTime::now() + std::time::Duration::from_secs(86400 * 365),
            )),
        );

        let mut xml = Vec::new();
        plist::Value::Dictionary(root)
            .to_writer_xml(&mut xml)
            .unwrap();

        let mut data = vec![0x30, 0x82, 0x01, 0x00];
        data.extend_from_slice(&xml);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        data
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testcredentials};

    #[test]
    fn profile_fields_extracted_from_envelope() {
        let cert = testcredentials::signing_certificate();
        let der = cert.certificate.encode_der().unwrap();
        let data = testutil::synthesize_profile("com.example.App", "TESTTEAM12", vec![der]);

        let profile = ProvisioningProfile::from_bytes(&data).unwrap();
        assert_eq!(profile.name(), Some("Test Profile"));
        assert_eq!(profile.team_identifier(), Some("TESTTEAM12"));
        assert_eq!(
            profile.application_identifier().unwrap(),
            "TESTTEAM12.com.example.App"
        );
        assert!(profile.allows_task_debugging());
        assert!(!profile.is_expired_at(std::time::SystemTime::now()));

        let serials = profile.developer_certificate_serials().unwrap();
        assert_eq!(serials.len(), 1);
        assert_eq!(&serials[0], cert.serial_number());
    }

    #[test]
    fn application_identifier_matching() {
        let data = testutil::synthesize_profile("com.example.App", "TESTTEAM12", vec![]);
        let profile = ProvisioningProfile::from_bytes(&data).unwrap();
        assert!(profile.covers_bundle_id("com.example.App").unwrap());
        assert!(!profile.covers_bundle_id("com.somebody.Else").unwrap());
        assert!(!profile.covers_bundle_id("com.example.App.Widget").unwrap());

        let data = testutil::synthesize_profile("com.example.*", "TESTTEAM12", vec![]);
        let profile = ProvisioningProfile::from_bytes(&data).unwrap();
        assert!(profile.covers_bundle_id("com.example.App").unwrap());
        assert!(profile.covers_bundle_id("com.example.Widget").unwrap());
        assert!(!profile.covers_bundle_id("com.other.App").unwrap());
    }

    #[test]
    fn entitlement_overrides_win() {
        let data = testutil::synthesize_profile("com.example.App", "TESTTEAM12", vec![]);
        let profile = ProvisioningProfile::from_bytes(&data).unwrap();

        let mut overrides = plist::Dictionary::new();
        overrides.insert("get-task-allow".to_string(), plist::Value::Boolean(false));
        overrides.insert(
            "aps-environment".to_string(),
            plist::Value::String("development".to_string()),
        );

        let merged = profile.merged_entitlements(Some(&overrides)).unwrap();
        assert_eq!(
            merged.get("get-task-allow").and_then(|v| v.as_boolean()),
            Some(false)
        );
        assert_eq!(
            merged.get("aps-environment").and_then(|v| v.as_string()),
            Some("development")
        );
        assert!(merged.contains_key("application-identifier"));
    }

    #[test]
    fn garbage_data_is_rejected() {
        assert!(matches!(
            ProvisioningProfile::from_bytes(&[0u8; 64]),
            Err(SigningError::ProvisioningProfileMalformed(_))
        ));
    }
}
