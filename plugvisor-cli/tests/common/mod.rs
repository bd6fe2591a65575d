//! Temporary workspace for driving the CLI end to end.

#![allow(dead_code)]

use clap::Parser;
use plugvisor_cli::{Cli, execute};
use std::path::PathBuf;
use tempfile::TempDir;

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    /// Empty workspace with a config that accepts unsigned bundles.
    pub fn new() -> Self {
        let ws = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        ws.write_config("allow_unsigned_plugins = true\n");
        ws
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write_config(&self, contents: &str) {
        std::fs::write(self.path("plugvisor.toml"), contents).unwrap();
    }

    /// Writes `<name>.toml` and `<name>.wasm` for a plugin manifest.
    pub fn source(&self, name: &str, id: &str, version: &str, permissions: &[&str]) {
        let perms: Vec<String> = permissions.iter().map(|p| format!("\"{p}\"")).collect();
        let manifest = format!(
            "id = \"{id}\"\nname = \"Notes\"\nversion = \"{version}\"\npermissions = [{}]\n",
            perms.join(", ")
        );
        std::fs::write(self.path(&format!("{name}.toml")), manifest).unwrap();
        std::fs::write(self.path(&format!("{name}.wasm")), b"\0asm\x01\0\0\0").unwrap();
    }

    /// Runs one command against this workspace and returns its stdout.
    pub async fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        let config = self.path("plugvisor.toml");
        let data = self.path("data");
        let mut argv = vec![
            "plugvisor".to_string(),
            "--config".to_string(),
            config.display().to_string(),
            "--data-dir".to_string(),
            data.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        let cli = Cli::try_parse_from(argv)?;
        let mut out = Vec::new();
        execute(cli, &mut out).await?;
        Ok(String::from_utf8(out)?)
    }

    /// Packs `<name>.toml` + `<name>.wasm` into `<name>.pvb`.
    pub async fn pack(&self, name: &str, key: Option<&str>) -> String {
        let manifest = self.path(&format!("{name}.toml"));
        let code = self.path(&format!("{name}.wasm"));
        let out = self.path(&format!("{name}.pvb"));
        let mut args = vec![
            "pack".to_string(),
            manifest.display().to_string(),
            code.display().to_string(),
            "--out".to_string(),
            out.display().to_string(),
        ];
        if let Some(key) = key {
            args.push("--key".into());
            args.push(self.path(key).display().to_string());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args).await.unwrap();
        out.display().to_string()
    }
}
