//! Plugvisor plugin bundle format.
//!
//! A bundle is a zip archive containing:
//! - `manifest.toml`:   plugin identity, version, engine requirement, permissions, limits
//! - `plugin.wasm`:     the plugin's code (Wasm module, or an opaque blob for native runtimes)
//! - `README.md`:       optional documentation
//! - `assets/`:         optional static assets
//! - `checksum.sha256`: hex SHA-256 content hash recorded by the packer
//! - `signature.bin`:   optional Ed25519 detached signature over the content hash
//!
//! The content hash covers every entry except `checksum.sha256` and `signature.bin`.

mod error;
mod manifest;
mod package;
mod signing;

pub use error::BundleError;
pub use manifest::{ManifestLimits, PluginManifest};
pub use package::{BundleBuilder, PluginBundle};
pub use signing::{KeyPair, Signature, SigningKey, VerifyingKey};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fillet_manifest() -> PluginManifest {
        PluginManifest {
            id: "acme.fillet-tools".into(),
            name: "Fillet Tools".into(),
            description: "Edge fillet and chamfer nodes".into(),
            version: "1.2.0".into(),
            author: "Acme".into(),
            engines: Some(">=1.0, <2".into()),
            permissions: vec!["storage-read".into(), "storage-write".into()],
            exports: vec!["fillet".into(), "chamfer".into()],
            limits: ManifestLimits {
                memory_bytes: Some(16 * 1024 * 1024),
                timeout_ms: Some(2_000),
                network_allowlist: vec!["api.acme.dev".into()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn roundtrip_pack_unpack() {
        let code = b"fake wasm module content";
        let readme = b"# Fillet Tools\n\nA test.";

        let bytes = BundleBuilder::new(fillet_manifest())
            .code(code.to_vec())
            .readme(readme.to_vec())
            .build()
            .expect("pack should succeed");

        assert!(!bytes.is_empty());

        let bundle = PluginBundle::from_bytes(&bytes).expect("unpack should succeed");
        assert_eq!(bundle.manifest, fillet_manifest());
        assert_eq!(bundle.code, code.to_vec());
        assert_eq!(bundle.readme.as_deref(), Some(readme.as_slice()));
        assert!(bundle.signature.is_none());
    }

    #[test]
    fn sign_and_verify() {
        let keypair = KeyPair::generate();

        let bytes = BundleBuilder::new(fillet_manifest())
            .code(b"signed wasm content".to_vec())
            .sign(&keypair.signing_key)
            .build()
            .expect("pack+sign should succeed");

        let bundle = PluginBundle::from_bytes(&bytes).expect("unpack should succeed");
        assert!(bundle.is_signed());
        assert!(bundle.verify(&keypair.verifying_key).is_ok());
        assert!(bundle.verify_integrity().is_ok());
    }

    #[test]
    fn verify_fails_with_wrong_key() {
        let real = KeyPair::generate();
        let wrong = KeyPair::generate();

        let bytes = BundleBuilder::new(fillet_manifest())
            .code(b"wasm".to_vec())
            .sign(&real.signing_key)
            .build()
            .unwrap();

        let bundle = PluginBundle::from_bytes(&bytes).unwrap();
        assert!(matches!(
            bundle.verify(&wrong.verifying_key),
            Err(BundleError::SignatureInvalid)
        ));
    }

    #[test]
    fn unsigned_bundle_verify_fails() {
        let bytes = BundleBuilder::new(fillet_manifest())
            .code(b"content".to_vec())
            .build()
            .unwrap();

        let bundle = PluginBundle::from_bytes(&bytes).unwrap();
        let keypair = KeyPair::generate();
        assert!(matches!(
            bundle.verify(&keypair.verifying_key),
            Err(BundleError::NotSigned)
        ));
    }

    #[test]
    fn signature_over_modified_code_fails() {
        let keypair = KeyPair::generate();
        let bytes = BundleBuilder::new(fillet_manifest())
            .code(b"trusted".to_vec())
            .sign(&keypair.signing_key)
            .build()
            .unwrap();

        let mut bundle = PluginBundle::from_bytes(&bytes).unwrap();
        bundle.code = b"swapped".to_vec();
        assert!(bundle.verify(&keypair.verifying_key).is_err());
    }

    #[test]
    fn manifest_toml_roundtrip() {
        let manifest = fillet_manifest();
        let toml_str = toml::to_string_pretty(&manifest).expect("serialize");
        let parsed: PluginManifest = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(manifest, parsed);
    }

    #[test]
    fn content_hash_deterministic() {
        let pkg1 = BundleBuilder::new(fillet_manifest())
            .code(b"deterministic".to_vec())
            .build()
            .unwrap();
        let pkg2 = BundleBuilder::new(fillet_manifest())
            .code(b"deterministic".to_vec())
            .build()
            .unwrap();

        let p1 = PluginBundle::from_bytes(&pkg1).unwrap();
        let p2 = PluginBundle::from_bytes(&pkg2).unwrap();
        assert_eq!(p1.content_hash(), p2.content_hash());
    }

    #[test]
    fn bundle_written_to_disk_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fillet.plugin");
        let bytes = BundleBuilder::new(fillet_manifest())
            .code(b"wasm".to_vec())
            .build()
            .unwrap();
        std::fs::write(&path, &bytes).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let bundle = PluginBundle::open(file).unwrap();
        assert_eq!(bundle.manifest.id, "acme.fillet-tools");
    }
}
