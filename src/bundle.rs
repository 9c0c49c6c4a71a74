// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application bundle access.
//!
//! Signing reads and writes bundle files through a small provider trait so
//! the orchestration is not tied to an on-disk layout. Paths are
//! bundle-relative with `/` separators.

use {
    crate::error::SigningError,
    log::debug,
    std::path::{Path, PathBuf},
};

/// Relative path of the resource catalog within a bundle.
pub const CODE_RESOURCES_PATH: &str = "_CodeSignature/CodeResources";

/// Relative path of the embedded provisioning profile.
pub const EMBEDDED_PROFILE_PATH: &str = "embedded.mobileprovision";

/// Access to a bundle's file contents.
pub trait FileProvider {
    fn read_file(&self, rel_path: &str) -> Result<Vec<u8>, SigningError>;

    fn write_file(&mut self, rel_path: &str, data: &[u8]) -> Result<(), SigningError>;

    /// All payload file paths, sorted, recursively.
    fn payload_files(&self) -> Result<Vec<String>, SigningError>;
}

/// Provider backed by a plain directory.
pub struct DirectoryFileProvider {
    root: PathBuf,
}

impl DirectoryFileProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn collect_files(
        &self,
        dir: &Path,
        prefix: &str,
        files: &mut Vec<String>,
    ) -> Result<(), SigningError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };

            if entry.file_type()?.is_dir() {
                self.collect_files(&entry.path(), &rel, files)?;
            } else {
                files.push(rel);
            }
        }

        Ok(())
    }
}

impl FileProvider for DirectoryFileProvider {
    fn read_file(&self, rel_path: &str) -> Result<Vec<u8>, SigningError> {
        Ok(std::fs::read(self.root.join(rel_path))?)
    }

    fn write_file(&mut self, rel_path: &str, data: &[u8]) -> Result<(), SigningError> {
        let path = self.root.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(std::fs::write(path, data)?)
    }

    fn payload_files(&self) -> Result<Vec<String>, SigningError> {
        let mut files = Vec::new();
        self.collect_files(&self.root, "", &mut files)?;
        files.sort();

        Ok(files)
    }
}

/// An application bundle viewed through a file provider.
pub struct Bundle<P: FileProvider> {
    pub provider: P,
    info_plist: plist::Dictionary,
}

impl<P: FileProvider> Bundle<P> {
    pub fn open(provider: P) -> Result<Self, SigningError> {
        let data = provider.read_file("Info.plist")?;
        let value =
            plist::Value::from_reader_xml(data.as_slice()).map_err(SigningError::PlistParseXml)?;
        let info_plist = value
            .into_dictionary()
            .ok_or(SigningError::BundleNoIdentifier)?;

        Ok(Self {
            provider,
            info_plist,
        })
    }

    pub fn info_plist(&self) -> &plist::Dictionary {
        &self.info_plist
    }

    pub fn set_info_plist_key(&mut self, key: &str, value: plist::Value) {
        self.info_plist.insert(key.to_string(), value);
    }

    pub fn bundle_identifier(&self) -> Result<&str, SigningError> {
        self.info_plist
            .get("CFBundleIdentifier")
            .and_then(|v| v.as_string())
            .ok_or(SigningError::BundleNoIdentifier)
    }

    pub fn main_executable_name(&self) -> Result<&str, SigningError> {
        self.info_plist
            .get("CFBundleExecutable")
            .and_then(|v| v.as_string())
            .ok_or(SigningError::BundleNoMainExecutable)
    }

    /// Serialize the (possibly modified) Info.plist back to XML. This is the
    /// exact document hashed into the Info special slot, so it is also
    /// written back to the bundle.
    pub fn flush_info_plist(&mut self) -> Result<Vec<u8>, SigningError> {
        let mut data = Vec::new();
        plist::Value::Dictionary(self.info_plist.clone())
            .to_writer_xml(&mut data)
            .map_err(SigningError::PlistSerializeXml)?;

        self.provider.write_file("Info.plist", &data)?;

        Ok(data)
    }

    /// Install provisioning profile data as `embedded.mobileprovision`.
    pub fn embed_provisioning_profile(&mut self, data: &[u8]) -> Result<(), SigningError> {
        debug!("embedding provisioning profile ({} bytes)", data.len());
        self.provider.write_file(EMBEDDED_PROFILE_PATH, data)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use {super::*, std::collections::BTreeMap};

    /// In-memory provider for tests.
    #[derive(Default)]
    pub struct MemoryFileProvider {
        pub files: BTreeMap<String, Vec<u8>>,
    }

    impl FileProvider for MemoryFileProvider {
        fn read_file(&self, rel_path: &str) -> Result<Vec<u8>, SigningError> {
            self.files.get(rel_path).cloned().ok_or_else(|| {
                SigningError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    rel_path.to_string(),
                ))
            })
        }

        fn write_file(&mut self, rel_path: &str, data: &[u8]) -> Result<(), SigningError> {
            self.files.insert(rel_path.to_string(), data.to_vec());
            Ok(())
        }

        fn payload_files(&self) -> Result<Vec<String>, SigningError> {
            Ok(self.files.keys().cloned().collect())
        }
    }

    pub fn make_info_plist(identifier: &str, executable: &str) -> Vec<u8> {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "CFBundleIdentifier".to_string(),
            plist::Value::String(identifier.to_string()),
        );
        dict.insert(
            "CFBundleExecutable".to_string(),
            plist::Value::String(executable.to_string()),
        );

        let mut data = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_xml(&mut data)
            .unwrap();
        data
    }
}
