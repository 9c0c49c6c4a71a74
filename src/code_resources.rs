// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `CodeResources` resource catalog.
//!
//! The catalog seals every payload file of a bundle with its digest. Two
//! generations coexist in one document: the legacy `rules`/`files` pair
//! (SHA-1 only) and `rules2`/`files2` (SHA-1 plus SHA-256). The main
//! executable, `Info.plist`, and everything under `_CodeSignature/` are
//! sealed elsewhere (through code directory special slots) and never appear
//! in the catalog.

use {
    crate::{
        bundle::{FileProvider, CODE_RESOURCES_PATH},
        embedded_signature::DigestType,
        error::SigningError,
    },
    log::debug,
    std::collections::BTreeMap,
};

/// One rule entry as emitted into `rules` or `rules2`.
#[derive(Clone, Debug)]
pub struct ResourceRule {
    pub pattern: String,
    pub optional: bool,
    pub omit: bool,
    pub weight: Option<f64>,
}

impl ResourceRule {
    fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            optional: false,
            omit: false,
            weight: None,
        }
    }

    fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn omit(mut self) -> Self {
        self.omit = true;
        self
    }

    fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    fn to_plist(&self) -> plist::Value {
        if !self.optional && !self.omit && self.weight.is_none() {
            return plist::Value::Boolean(true);
        }

        let mut dict = plist::Dictionary::new();
        if self.optional {
            dict.insert("optional".to_string(), plist::Value::Boolean(true));
        }
        if self.omit {
            dict.insert("omit".to_string(), plist::Value::Boolean(true));
        }
        if let Some(weight) = self.weight {
            dict.insert("weight".to_string(), plist::Value::Real(weight));
        }

        plist::Value::Dictionary(dict)
    }
}

/// The standard legacy rule set.
fn default_rules() -> Vec<ResourceRule> {
    vec![
        ResourceRule::new("^"),
        ResourceRule::new("^.*\\.lproj/").optional().weight(1000.0),
        ResourceRule::new("^.*\\.lproj/locversion.plist$")
            .omit()
            .weight(1100.0),
        ResourceRule::new("^Base\\.lproj/").weight(1010.0),
        ResourceRule::new("^version.plist$"),
    ]
}

/// The standard second-generation rule set.
fn default_rules2() -> Vec<ResourceRule> {
    vec![
        ResourceRule::new(".*\\.dSYM($|/)").weight(11.0),
        ResourceRule::new("^(.*/)?\\.DS_Store$").omit().weight(2000.0),
        ResourceRule::new("^.*"),
        ResourceRule::new("^.*\\.lproj/").optional().weight(1000.0),
        ResourceRule::new("^.*\\.lproj/locversion.plist$")
            .omit()
            .weight(1100.0),
        ResourceRule::new("^Base\\.lproj/").weight(1010.0),
        ResourceRule::new("^Info\\.plist$").omit().weight(20.0),
        ResourceRule::new("^PkgInfo$").omit().weight(20.0),
        ResourceRule::new("^embedded\\.provisionprofile$").weight(20.0),
        ResourceRule::new("^version\\.plist$").weight(20.0),
    ]
}

struct SealedFile {
    sha1: Vec<u8>,
    sha256: Vec<u8>,
    optional: bool,
}

/// Builds a `CodeResources` document from bundle contents.
pub struct CodeResourcesBuilder {
    rules: Vec<ResourceRule>,
    rules2: Vec<ResourceRule>,
    files: BTreeMap<String, SealedFile>,
}

impl CodeResourcesBuilder {
    pub fn new_with_default_rules() -> Self {
        Self {
            rules: default_rules(),
            rules2: default_rules2(),
            files: BTreeMap::new(),
        }
    }

    /// Whether a payload path is sealed outside the catalog.
    fn is_excluded(path: &str, main_executable: &str) -> bool {
        path == main_executable
            || path == "Info.plist"
            || path == "CodeResources"
            || path.starts_with("_CodeSignature/")
    }

    fn is_optional(path: &str) -> bool {
        // Localizations are droppable per the default rules.
        path.split('/')
            .any(|component| component.ends_with(".lproj") && component != "Base.lproj")
    }

    pub fn seal_file(&mut self, path: &str, content: &[u8]) {
        self.files.insert(
            path.to_string(),
            SealedFile {
                sha1: DigestType::Sha1.digest_data(content),
                sha256: DigestType::Sha256.digest_data(content),
                optional: Self::is_optional(path),
            },
        );
    }

    /// Seal every payload file except the excluded set, then serialize the
    /// catalog to XML.
    pub fn seal_bundle(
        &mut self,
        provider: &impl FileProvider,
        main_executable: &str,
    ) -> Result<Vec<u8>, SigningError> {
        for path in provider.payload_files()? {
            if Self::is_excluded(&path, main_executable) {
                debug!("excluding {} from resource catalog", path);
                continue;
            }

            let content = provider.read_file(&path)?;
            self.seal_file(&path, &content);
        }

        self.to_xml()
    }

    pub fn to_xml(&self) -> Result<Vec<u8>, SigningError> {
        let mut files = plist::Dictionary::new();
        let mut files2 = plist::Dictionary::new();

        for (path, sealed) in &self.files {
            let legacy = if sealed.optional {
                let mut dict = plist::Dictionary::new();
                dict.insert("hash".to_string(), plist::Value::Data(sealed.sha1.clone()));
                dict.insert("optional".to_string(), plist::Value::Boolean(true));
                plist::Value::Dictionary(dict)
            } else {
                plist::Value::Data(sealed.sha1.clone())
            };
            files.insert(path.clone(), legacy);

            let mut entry = plist::Dictionary::new();
            entry.insert("hash".to_string(), plist::Value::Data(sealed.sha1.clone()));
            entry.insert(
                "hash2".to_string(),
                plist::Value::Data(sealed.sha256.clone()),
            );
            if sealed.optional {
                entry.insert("optional".to_string(), plist::Value::Boolean(true));
            }
            files2.insert(path.clone(), plist::Value::Dictionary(entry));
        }

        let mut root = plist::Dictionary::new();
        root.insert("files".to_string(), plist::Value::Dictionary(files));
        root.insert("files2".to_string(), plist::Value::Dictionary(files2));
        root.insert("rules".to_string(), rules_to_plist(&self.rules));
        root.insert("rules2".to_string(), rules_to_plist(&self.rules2));

        let mut data = Vec::new();
        plist::Value::Dictionary(root)
            .to_writer_xml(&mut data)
            .map_err(SigningError::PlistSerializeXml)?;

        Ok(data)
    }

    /// Seal the bundle and write the catalog to its standard location,
    /// returning the exact bytes written.
    pub fn write_to_bundle(
        &mut self,
        provider: &mut impl FileProvider,
        main_executable: &str,
    ) -> Result<Vec<u8>, SigningError> {
        let data = self.seal_bundle(provider, main_executable)?;
        provider.write_file(CODE_RESOURCES_PATH, &data)?;

        Ok(data)
    }
}

fn rules_to_plist(rules: &[ResourceRule]) -> plist::Value {
    let mut dict = plist::Dictionary::new();
    for rule in rules {
        dict.insert(rule.pattern.clone(), rule.to_plist());
    }

    plist::Value::Dictionary(dict)
}
