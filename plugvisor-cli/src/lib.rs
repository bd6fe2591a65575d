//! Commands behind the `plugvisor` binary.
//!
//! Every command that touches installed plugins opens a [`PluginManager`]
//! over a [`FileStore`] in the data directory, so state carries over between
//! invocations. Output goes to the writer passed to [`execute`].

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plugvisor_bundle::{BundleBuilder, KeyPair, PluginBundle, PluginManifest, SigningKey};
use plugvisor_host::{
    ExecutionScope, FileStore, InstallOptions, InstallSource, JournalEntry, Permission,
    PluginManager, PluginManagerConfig, WasmRuntime, load_journal,
};
use serde_json::{Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Journal file used when the config does not name one.
pub const DEFAULT_JOURNAL: &str = "journal.jsonl";

#[derive(Parser, Debug)]
#[command(name = "plugvisor")]
#[command(about = "Install, run and roll back sandboxed plugins")]
pub struct Cli {
    /// Path to the manager config file
    #[arg(short, long, default_value = "plugvisor.toml")]
    pub config: PathBuf,

    /// Directory holding plugin records, backups and storage
    #[arg(short, long, default_value = ".plugvisor")]
    pub data_dir: PathBuf,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate an Ed25519 signing key
    Keygen {
        /// Where to write the hex secret; the public key goes to `<out>.pub`
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Pack a manifest and code module into a bundle
    Pack {
        manifest: PathBuf,
        code: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
        #[arg(long)]
        readme: Option<PathBuf>,
        /// Hex secret key file to sign with
        #[arg(short, long)]
        key: Option<PathBuf>,
    },
    /// Print a bundle's manifest and integrity status
    Inspect { bundle: PathBuf },
    /// Install a bundle
    Install {
        bundle: PathBuf,
        /// Skip signature verification (needs allow_unsigned_plugins)
        #[arg(long)]
        unsigned: bool,
        /// Grant only these permissions instead of everything declared
        #[arg(long = "grant")]
        grants: Vec<String>,
        /// Reject the bundle unless its content hash matches
        #[arg(long)]
        checksum: Option<String>,
    },
    /// Replace an installed plugin with a newer bundle
    Update {
        plugin_id: String,
        bundle: PathBuf,
        #[arg(long)]
        unsigned: bool,
        #[arg(long = "grant")]
        grants: Vec<String>,
    },
    Uninstall { plugin_id: String },
    /// Restore the record and storage saved by the last update
    Rollback { plugin_id: String },
    Grant { plugin_id: String, permission: String },
    Revoke { plugin_id: String, permission: String },
    Status { plugin_id: String },
    List,
    /// Run an exported function and print its result
    Run {
        plugin_id: String,
        function: String,
        /// JSON arguments
        #[arg(long, default_value = "null")]
        args: String,
        #[arg(long, default_value = "cli")]
        user: String,
        #[arg(long)]
        project: Option<String>,
    },
    /// Show the audit trail of a plugin, or a summary of all executions
    Audit {
        plugin_id: Option<String>,
        /// Read entries from this journal instead of the manager's
        #[arg(long)]
        journal: Option<PathBuf>,
    },
}

/// Runs one command, writing human-readable output to `out`.
pub async fn execute(cli: Cli, out: &mut impl Write) -> Result<()> {
    match &cli.command {
        Command::Keygen { out: path } => return keygen(path, out),
        Command::Pack {
            manifest,
            code,
            out: path,
            readme,
            key,
        } => return pack(manifest, code, path, readme.as_deref(), key.as_deref(), out),
        Command::Inspect { bundle } => return inspect(bundle, out),
        Command::Audit {
            plugin_id,
            journal: Some(journal),
        } => return audit_journal(journal, plugin_id.as_deref(), out),
        _ => {}
    }

    let manager = open_manager(&cli.config, &cli.data_dir)?;
    let result = manage(&manager, cli.command, out).await;
    manager.shutdown().await?;
    result
}

/// Opens the manager over the data directory, journaling there unless the
/// config names another file.
pub fn open_manager(config_path: &Path, data_dir: &Path) -> Result<PluginManager> {
    let mut config = PluginManagerConfig::load_from(config_path)?;
    if config.telemetry.journal_path.is_none() {
        config.telemetry.journal_path = Some(data_dir.join(DEFAULT_JOURNAL));
    }
    let store = FileStore::open(data_dir.join("plugins"))
        .with_context(|| format!("failed to open store in {}", data_dir.display()))?;
    let manager = PluginManager::builder()
        .config(config)
        .store(Arc::new(store))
        .runtime(Arc::new(WasmRuntime::new()))
        .build()?;
    Ok(manager)
}

async fn manage(manager: &PluginManager, command: Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Install {
            bundle,
            unsigned,
            grants,
            checksum,
        } => {
            let options = InstallOptions {
                expected_checksum: checksum,
                ..install_options(&bundle, unsigned, &grants)?
            };
            let plugin = manager
                .install_plugin(&read_bundle(&bundle)?, options)
                .await?;
            writeln!(
                out,
                "Installed {} {} (trusted: {})",
                plugin.id, plugin.manifest.version, plugin.trusted
            )?;
        }
        Command::Update {
            plugin_id,
            bundle,
            unsigned,
            grants,
        } => {
            let options = install_options(&bundle, unsigned, &grants)?;
            let plugin = manager
                .update_plugin(&plugin_id, &read_bundle(&bundle)?, options)
                .await?;
            writeln!(
                out,
                "Updated {} to {} (revision {})",
                plugin.id, plugin.manifest.version, plugin.version
            )?;
        }
        Command::Uninstall { plugin_id } => {
            manager.uninstall_plugin(&plugin_id).await?;
            writeln!(out, "Uninstalled {plugin_id}")?;
        }
        Command::Rollback { plugin_id } => {
            let plugin = manager.rollback_plugin(&plugin_id).await?;
            writeln!(
                out,
                "Rolled back {} to {} (revision {})",
                plugin.id, plugin.manifest.version, plugin.version
            )?;
        }
        Command::Grant {
            plugin_id,
            permission,
        } => {
            let permission = parse_permission(&permission)?;
            manager.grant_permission(&plugin_id, permission).await?;
            writeln!(out, "Granted {permission} to {plugin_id}")?;
        }
        Command::Revoke {
            plugin_id,
            permission,
        } => {
            let permission = parse_permission(&permission)?;
            manager.revoke_permission(&plugin_id, permission).await?;
            writeln!(out, "Revoked {permission} from {plugin_id}")?;
        }
        Command::Status { plugin_id } => {
            let status = manager.get_plugin_status(&plugin_id).await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&status)?)?;
        }
        Command::List => {
            let plugins = manager.list_plugins();
            if plugins.is_empty() {
                writeln!(out, "No plugins installed")?;
            }
            for plugin in plugins {
                let granted: Vec<&str> = plugin
                    .granted
                    .granted_permissions()
                    .iter()
                    .map(Permission::name)
                    .collect();
                writeln!(
                    out,
                    "{}\t{}\trev {}\t{}\t{}",
                    plugin.id,
                    plugin.manifest.version,
                    plugin.version,
                    if plugin.trusted { "trusted" } else { "unsigned" },
                    granted.join(",")
                )?;
            }
        }
        Command::Run {
            plugin_id,
            function,
            args,
            user,
            project,
        } => {
            let args: Value = serde_json::from_str(&args).context("--args is not valid JSON")?;
            let mut scope = ExecutionScope::user(user);
            if let Some(project) = project {
                scope = scope.project(project);
            }
            let result = manager
                .execute_plugin(&plugin_id, &function, args, scope)
                .await?;
            for log in &result.logs {
                debug!(level = ?log.level, "{}", log.message);
            }
            writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
        }
        Command::Audit { plugin_id, .. } => match plugin_id {
            Some(plugin_id) => {
                for entry in manager.get_audit_log(&plugin_id) {
                    writeln!(
                        out,
                        "{} {:?} {}",
                        entry.timestamp.to_rfc3339(),
                        entry.level,
                        entry.message
                    )?;
                }
            }
            None => {
                let summary = manager.telemetry().summary(None);
                writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
            }
        },
        Command::Keygen { .. } | Command::Pack { .. } | Command::Inspect { .. } => {}
    }
    Ok(())
}

fn keygen(path: &Path, out: &mut impl Write) -> Result<()> {
    let pair = KeyPair::generate();
    std::fs::write(path, pair.signing_key.to_hex())
        .with_context(|| format!("failed to write {}", path.display()))?;
    let public_path = public_key_path(path);
    std::fs::write(&public_path, pair.verifying_key.to_hex())
        .with_context(|| format!("failed to write {}", public_path.display()))?;
    writeln!(out, "{}", pair.verifying_key.to_hex())?;
    Ok(())
}

/// `<path>.pub`, next to the secret key.
pub fn public_key_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

fn pack(
    manifest_path: &Path,
    code_path: &Path,
    out_path: &Path,
    readme: Option<&Path>,
    key: Option<&Path>,
    out: &mut impl Write,
) -> Result<()> {
    let manifest_text = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest: PluginManifest = toml::from_str(&manifest_text)
        .with_context(|| format!("invalid manifest {}", manifest_path.display()))?;
    let code = std::fs::read(code_path)
        .with_context(|| format!("failed to read {}", code_path.display()))?;

    let mut builder = BundleBuilder::new(manifest).code(code);
    if let Some(readme) = readme {
        builder = builder.readme(std::fs::read(readme)?);
    }
    if let Some(key) = key {
        let secret = std::fs::read_to_string(key)
            .with_context(|| format!("failed to read {}", key.display()))?;
        builder = builder.sign(&SigningKey::from_hex(secret.trim())?);
    }
    let bytes = builder.build()?;
    std::fs::write(out_path, &bytes)
        .with_context(|| format!("failed to write {}", out_path.display()))?;

    let bundle = PluginBundle::from_bytes(&bytes)?;
    writeln!(
        out,
        "Packed {} {} -> {} (sha256 {})",
        bundle.manifest.id,
        bundle.manifest.version,
        out_path.display(),
        bundle.content_hash()
    )?;
    Ok(())
}

fn inspect(path: &Path, out: &mut impl Write) -> Result<()> {
    let bundle = read_bundle(path)?;
    let integrity = match bundle.verify_integrity() {
        Ok(hash) => json!({ "ok": true, "content_hash": hash }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };
    let report = json!({
        "manifest": bundle.manifest,
        "code_bytes": bundle.code.len(),
        "assets": bundle.assets.keys().collect::<Vec<_>>(),
        "signed": bundle.is_signed(),
        "integrity": integrity,
    });
    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(())
}

fn audit_journal(path: &Path, plugin_id: Option<&str>, out: &mut impl Write) -> Result<()> {
    let entries = load_journal(path)?;
    for entry in entries
        .iter()
        .filter(|e| plugin_id.is_none_or(|id| e.plugin_id() == id))
    {
        let line = match entry {
            JournalEntry::Execution(r) => format!(
                "{} execution {} {}::{} {:?}",
                r.recorded_at.to_rfc3339(),
                r.task_id,
                r.plugin_id,
                r.function,
                r.state
            ),
            JournalEntry::Lifecycle(r) => format!(
                "{} lifecycle {} {:?}{}",
                r.timestamp.to_rfc3339(),
                r.plugin_id,
                r.event,
                r.detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
            ),
        };
        writeln!(out, "{line}")?;
    }
    Ok(())
}

fn read_bundle(path: &Path) -> Result<PluginBundle> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    PluginBundle::from_bytes(&bytes).with_context(|| format!("invalid bundle {}", path.display()))
}

fn install_options(bundle: &Path, unsigned: bool, grants: &[String]) -> Result<InstallOptions> {
    let permissions = if grants.is_empty() {
        None
    } else {
        Some(
            grants
                .iter()
                .map(|g| parse_permission(g))
                .collect::<Result<Vec<_>>>()?,
        )
    };
    Ok(InstallOptions {
        source: InstallSource::File {
            path: bundle.to_path_buf(),
        },
        verify: !unsigned,
        permissions,
        expected_checksum: None,
    })
}

fn parse_permission(name: &str) -> Result<Permission> {
    name.parse().map_err(anyhow::Error::msg)
}
