//! Bundle packing, unpacking, and content hashing.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, Write};

use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::BundleError;
use crate::manifest::PluginManifest;
use crate::signing::{Signature, SigningKey, VerifyingKey};

const MANIFEST_ENTRY: &str = "manifest.toml";
const CODE_ENTRY: &str = "plugin.wasm";
const README_ENTRY: &str = "README.md";
const CHECKSUM_ENTRY: &str = "checksum.sha256";
const SIGNATURE_ENTRY: &str = "signature.bin";
const ASSETS_PREFIX: &str = "assets/";

/// An opened plugin bundle with parsed contents.
#[derive(Debug, Clone)]
pub struct PluginBundle {
    pub manifest: PluginManifest,
    pub code: Vec<u8>,
    pub readme: Option<Vec<u8>>,
    pub assets: BTreeMap<String, Vec<u8>>,
    /// Checksum the packer recorded in `checksum.sha256`.
    pub declared_checksum: Option<String>,
    pub signature: Option<Vec<u8>>,
    /// Manifest bytes exactly as packed; hashed instead of a re-serialization.
    manifest_raw: Vec<u8>,
}

impl PluginBundle {
    /// Opens and parses a bundle from a reader.
    pub fn open<R: Read + Seek>(reader: R) -> Result<Self, BundleError> {
        let mut archive = ZipArchive::new(reader)?;
        let mut manifest_raw = None;
        let mut code = None;
        let mut readme = None;
        let mut declared_checksum = None;
        let mut signature = None;
        let mut assets = BTreeMap::new();

        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;

            match name.as_str() {
                MANIFEST_ENTRY => manifest_raw = Some(data),
                CODE_ENTRY => code = Some(data),
                README_ENTRY => readme = Some(data),
                SIGNATURE_ENTRY => signature = Some(data),
                CHECKSUM_ENTRY => {
                    let text = String::from_utf8(data)
                        .map_err(|e| BundleError::ManifestInvalid(format!("checksum: {e}")))?;
                    declared_checksum = Some(text.trim().to_string());
                }
                n => match n.strip_prefix(ASSETS_PREFIX) {
                    Some(asset) if !asset.is_empty() => {
                        assets.insert(asset.to_string(), data);
                    }
                    _ => return Err(BundleError::UnexpectedEntry(name.clone())),
                },
            }
        }

        let manifest_raw =
            manifest_raw.ok_or_else(|| BundleError::MissingEntry(MANIFEST_ENTRY.into()))?;
        let code = code.ok_or_else(|| BundleError::MissingEntry(CODE_ENTRY.into()))?;
        let manifest: PluginManifest = toml::from_str(
            std::str::from_utf8(&manifest_raw)
                .map_err(|e| BundleError::ManifestInvalid(e.to_string()))?,
        )?;

        Ok(Self {
            manifest,
            code,
            readme,
            assets,
            declared_checksum,
            signature,
            manifest_raw,
        })
    }

    /// Opens a bundle held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BundleError> {
        Self::open(Cursor::new(bytes))
    }

    /// Computes a deterministic SHA-256 content hash over every hashed entry.
    /// `checksum.sha256` and `signature.bin` are excluded.
    pub fn content_hash(&self) -> String {
        let mut entries: Vec<(String, &[u8])> = vec![
            (MANIFEST_ENTRY.to_string(), self.manifest_raw.as_slice()),
            (CODE_ENTRY.to_string(), self.code.as_slice()),
        ];
        if let Some(readme) = &self.readme {
            entries.push((README_ENTRY.to_string(), readme.as_slice()));
        }
        for (name, data) in &self.assets {
            entries.push((format!("{ASSETS_PREFIX}{name}"), data.as_slice()));
        }
        hash_entries(entries)
    }

    /// Checks the declared checksum against the content hash and returns the hash.
    pub fn verify_integrity(&self) -> Result<String, BundleError> {
        let declared = self
            .declared_checksum
            .as_deref()
            .ok_or(BundleError::ChecksumMissing)?;
        let computed = self.content_hash();
        if !declared.eq_ignore_ascii_case(&computed) {
            return Err(BundleError::ChecksumMismatch {
                declared: declared.to_string(),
                computed,
            });
        }
        Ok(computed)
    }

    /// Verifies the bundle signature against the content hash.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), BundleError> {
        let sig_bytes = self.signature.as_ref().ok_or(BundleError::NotSigned)?;
        let signature = Signature::from_slice(sig_bytes)?;
        let hash = self.content_hash();
        key.verify(hash.as_bytes(), &signature)
    }

    /// The message a signature covers.
    pub fn signed_message(&self) -> Vec<u8> {
        self.content_hash().into_bytes()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

fn hash_entries(mut entries: Vec<(String, &[u8])>) -> String {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hasher = Sha256::new();
    for (name, data) in entries {
        hasher.update(name.as_bytes());
        hasher.update((data.len() as u64).to_le_bytes());
        hasher.update(data);
    }
    hex::encode(hasher.finalize())
}

/// Fluent builder for creating bundles.
pub struct BundleBuilder {
    manifest: PluginManifest,
    code: Vec<u8>,
    readme: Option<Vec<u8>>,
    assets: BTreeMap<String, Vec<u8>>,
    signing_key: Option<SigningKey>,
}

impl BundleBuilder {
    pub fn new(manifest: PluginManifest) -> Self {
        Self {
            manifest,
            code: Vec::new(),
            readme: None,
            assets: BTreeMap::new(),
            signing_key: None,
        }
    }

    pub fn code(mut self, data: Vec<u8>) -> Self {
        self.code = data;
        self
    }

    pub fn readme(mut self, data: Vec<u8>) -> Self {
        self.readme = Some(data);
        self
    }

    pub fn add_asset(mut self, name: &str, data: Vec<u8>) -> Self {
        self.assets.insert(name.to_string(), data);
        self
    }

    pub fn sign(mut self, key: &SigningKey) -> Self {
        // SigningKey is deliberately not Clone.
        self.signing_key = Some(SigningKey::from_bytes(&key.to_bytes()));
        self
    }

    /// Builds the zip archive and returns the raw bytes.
    pub fn build(self) -> Result<Vec<u8>, BundleError> {
        self.manifest.validate()?;
        let manifest_toml = toml::to_string_pretty(&self.manifest)?;

        let mut entries: Vec<(String, &[u8])> = vec![
            (MANIFEST_ENTRY.to_string(), manifest_toml.as_bytes()),
            (CODE_ENTRY.to_string(), self.code.as_slice()),
        ];
        if let Some(readme) = &self.readme {
            entries.push((README_ENTRY.to_string(), readme.as_slice()));
        }
        for (name, data) in &self.assets {
            entries.push((format!("{ASSETS_PREFIX}{name}"), data.as_slice()));
        }

        let checksum = hash_entries(entries.clone());
        let signature = self
            .signing_key
            .as_ref()
            .map(|key| key.sign(checksum.as_bytes()).to_bytes());

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for (name, data) in &entries {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(data)?;
        }

        zip.start_file(CHECKSUM_ENTRY, options)?;
        zip.write_all(checksum.as_bytes())?;

        if let Some(sig) = signature {
            zip.start_file(SIGNATURE_ENTRY, options)?;
            zip.write_all(&sig)?;
        }

        Ok(zip.finish()?.into_inner())
    }
}
