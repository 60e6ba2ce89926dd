use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "execmon";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and package execmon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the eBPF programs and the userspace binary
    Build {
        #[arg(long)]
        release: bool,

        /// Target triple, e.g. aarch64-unknown-linux-gnu
        #[arg(long)]
        target: Option<String>,
    },

    /// Build a release tarball with the binary, a sample config and a systemd unit
    Package {
        #[arg(long)]
        target: Option<String>,

        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }
    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask has no parent directory")
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    let mut path = root.join("target");
    if let Some(t) = target {
        path.push(t);
    }
    path.join(profile).join(BINARY)
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    // BPF programs only load on Linux; anything else has to go through `cross`.
    let cross = target.is_some_and(|t| t.contains("linux")) && !cfg!(target_os = "linux");
    let tool = if cross {
        if which::which("cross").is_err() {
            bail!("building for {} needs `cross` (cargo install cross) and Docker", target.unwrap_or_default());
        }
        "cross"
    } else {
        "cargo"
    };

    let mut cmd = Command::new(tool);
    cmd.current_dir(&root).args(["build", "-p", BINARY]);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.arg("--target").arg(t);
    }
    if which::which("bpf-linker").is_err() {
        println!("bpf-linker not found; the binary will not be able to attach");
    }

    let status = cmd.status().with_context(|| format!("Failed to run {tool} build"))?;
    if !status.success() {
        bail!("Build failed");
    }

    let binary = binary_path(&root, release, target);
    println!("Built {}", binary.display());
    Ok(binary)
}

fn systemd_unit(config_path: &str) -> String {
    format!(
        r#"[Unit]
Description=execmon process execution monitor
After=local-fs.target

[Service]
Type=simple
Environment=EXECMON_CONFIG={config_path}
ExecStart=/usr/local/bin/{BINARY}
Restart=on-failure
RestartSec=5
KillSignal=SIGTERM

CapabilityBoundingSet=CAP_BPF CAP_PERFMON CAP_SYS_RESOURCE CAP_SYS_ADMIN
AmbientCapabilities=CAP_BPF CAP_PERFMON CAP_SYS_RESOURCE CAP_SYS_ADMIN

[Install]
WantedBy=multi-user.target
"#
    )
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target)?;
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    let root = project_root()?;
    let output_path = root.join(output_dir);
    let arch = target.unwrap_or(env::consts::ARCH);
    let package_name = format!("{BINARY}-{}-{arch}", env!("CARGO_PKG_VERSION"));
    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir).context("Failed to create package directory")?;

    fs::copy(&binary, package_dir.join(BINARY))?;
    let sample = root.join("config.example.yaml");
    if sample.exists() {
        fs::copy(&sample, package_dir.join("execmon.yaml.example"))?;
    }
    fs::write(
        package_dir.join("execmon.service"),
        systemd_unit("/etc/execmon/execmon.yaml"),
    )?;
    fs::write(
        package_dir.join("install.sh"),
        r#"#!/bin/bash
set -e

INSTALL_DIR="${INSTALL_DIR:-/usr/local/bin}"
CONFIG_DIR="${CONFIG_DIR:-/etc/execmon}"

sudo install -m 755 execmon "$INSTALL_DIR/execmon"
sudo mkdir -p "$CONFIG_DIR"
if [ -f execmon.yaml.example ] && [ ! -f "$CONFIG_DIR/execmon.yaml" ]; then
    sudo cp execmon.yaml.example "$CONFIG_DIR/execmon.yaml"
fi
sudo install -m 644 execmon.service /etc/systemd/system/execmon.service
sudo systemctl daemon-reload

echo "Installed. Start with: sudo systemctl enable --now execmon"
"#,
    )?;

    let tarball = output_path.join(format!("{package_name}.tar.gz"));
    let status = Command::new("tar")
        .current_dir(&output_path)
        .arg("-czf")
        .arg(&tarball)
        .arg(&package_name)
        .status()
        .context("Failed to create tarball")?;
    if !status.success() {
        bail!("Failed to create tarball");
    }
    fs::remove_dir_all(&package_dir)?;

    println!("Package created: {}", tarball.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_points_at_config() {
        let unit = systemd_unit("/etc/execmon/execmon.yaml");
        assert!(unit.contains("Environment=EXECMON_CONFIG=/etc/execmon/execmon.yaml"));
        assert!(unit.contains("ExecStart=/usr/local/bin/execmon"));
    }

    #[test]
    fn binary_path_includes_target() {
        let root = Path::new("/w");
        assert_eq!(
            binary_path(root, true, Some("aarch64-unknown-linux-gnu")),
            Path::new("/w/target/aarch64-unknown-linux-gnu/release/execmon")
        );
        assert_eq!(
            binary_path(root, false, None),
            Path::new("/w/target/debug/execmon")
        );
    }
}
