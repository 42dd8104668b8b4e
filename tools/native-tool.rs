//! Inspect, verify and order `.native` module images
//!
//! ```text
//! native-tool inspect mathlib.native
//! native-tool verify mathlib.native --key 02ab...
//! native-tool order modules/*.native
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use native_loader::module::format::{decode, inspect, Architecture, DecodeOptions, Secp256k1TrustAnchor};
use native_loader::module::resolver::{resolve_load_order, GraphNode, HostTarget, Platform};
use native_loader::utils::init_logging;

#[derive(Parser)]
#[command(name = "native-tool", about = "Inspect and verify native module images")]
struct Cli {
    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the header and metadata of an image without decoding its sections
    Inspect {
        file: PathBuf,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Fully decode an image, checking its checksum and optionally its signature
    Verify {
        file: PathBuf,
        /// Trusted secp256k1 public key (hex); may be repeated
        #[arg(long = "key")]
        keys: Vec<String>,
    },
    /// Print the load order of a set of images
    Order {
        files: Vec<PathBuf>,
        /// Target architecture for platform-conditional dependencies
        #[arg(long, default_value = "x86_64")]
        arch: String,
        /// Target operating system for platform-conditional dependencies
        #[arg(long, default_value = "linux")]
        platform: String,
    },
}

#[derive(Serialize)]
struct InspectReport {
    file: PathBuf,
    format_version: u32,
    architecture: Architecture,
    signed: bool,
    code_size: u32,
    data_size: u32,
    exports: u32,
    checksum: String,
    name: Option<String>,
    version: Option<String>,
    dependencies: Vec<String>,
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn cmd_inspect(file: &Path, json: bool) -> Result<()> {
    let bytes = read(file)?;
    let summary = inspect(&bytes, &DecodeOptions::default())?;
    let header = &summary.header;
    let report = InspectReport {
        file: file.to_path_buf(),
        format_version: header.format_version,
        architecture: header.architecture,
        signed: summary.metadata.as_ref().is_some_and(|m| m.is_signed()),
        code_size: header.code.size,
        data_size: header.data.size,
        exports: header.export_count,
        checksum: format!("{:016x}", header.checksum),
        name: summary.metadata.as_ref().map(|m| m.name.clone()),
        version: summary.metadata.as_ref().map(|m| m.version.to_string()),
        dependencies: summary
            .metadata
            .as_ref()
            .map(|m| {
                m.dependencies
                    .iter()
                    .map(|d| format!("{} {:?} {}", d.target, d.kind, d.constraint))
                    .collect()
            })
            .unwrap_or_default(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", report.file.display());
    println!("  format:       v{}", report.format_version);
    println!("  architecture: {}", report.architecture);
    println!(
        "  module:       {} {}",
        report.name.as_deref().unwrap_or("-"),
        report.version.as_deref().unwrap_or("-")
    );
    println!("  code/data:    {} / {} bytes", report.code_size, report.data_size);
    println!("  exports:      {}", report.exports);
    println!("  checksum:     {}", report.checksum);
    println!("  signed:       {}", report.signed);
    for dep in &report.dependencies {
        println!("  depends on:   {}", dep);
    }
    Ok(())
}

fn cmd_verify(file: &Path, keys: &[String]) -> Result<()> {
    let bytes = read(file)?;
    let module = if keys.is_empty() {
        decode(&bytes, &DecodeOptions::default())?
    } else {
        let anchor = Secp256k1TrustAnchor::from_hex_keys(keys).map_err(anyhow::Error::msg)?;
        decode(&bytes, &DecodeOptions::with_verifier(&anchor).require_signature())?
    };

    println!("{}: ok ({} exports)", file.display(), module.exports.len());
    for export in &module.exports {
        println!("  {:?} {} @ {:#x} ({} bytes)", export.kind, export.name, export.offset, export.size);
    }
    Ok(())
}

fn cmd_order(files: &[PathBuf], arch: &str, platform: &str) -> Result<()> {
    let architecture = match arch {
        "x86_64" => Architecture::X86_64,
        "arm64" | "aarch64" => Architecture::Arm64,
        "x86" | "x86_32" => Architecture::X86_32,
        other => bail!("unknown architecture {}", other),
    };
    let platform = match platform {
        "linux" => Platform::Linux,
        "macos" => Platform::MacOs,
        "windows" => Platform::Windows,
        "freebsd" => Platform::FreeBsd,
        other => bail!("unknown platform {}", other),
    };

    let mut nodes = Vec::with_capacity(files.len());
    for file in files {
        let bytes = read(file)?;
        let summary = inspect(&bytes, &DecodeOptions::default())?;
        let Some(metadata) = summary.metadata else {
            bail!("{} carries no metadata", file.display());
        };
        nodes.push(GraphNode::new(metadata.name, metadata.dependencies));
    }

    let host = HostTarget::new(platform, architecture);
    let resolution = resolve_load_order(&nodes, &host)?;
    for (i, name) in resolution.load_order.iter().enumerate() {
        println!("{:>3}. {}", i + 1, name);
    }
    for (module, dependency) in &resolution.missing {
        eprintln!("warning: {} requires {}, which is not in the set", module, dependency);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    match cli.command {
        Command::Inspect { file, json } => cmd_inspect(&file, json),
        Command::Verify { file, keys } => cmd_verify(&file, &keys),
        Command::Order { files, arch, platform } => cmd_order(&files, &arch, &platform),
    }
}
