// hops-core/src/devtools.rs
//! Host toolchain discovery.
use std::env;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use hops_common::error::{HopsError, Result};
use hops_common::model::platform::{Compiler, CompilerFamily, Platform, ToolVersion};
use tracing::debug;

pub fn find_compiler(name: &str) -> Result<PathBuf> {
    let env_var_name = match name {
        "cc" => "CC",
        "c++" | "cxx" => "CXX",
        _ => "",
    };
    if !env_var_name.is_empty() {
        if let Ok(compiler_path) = env::var(env_var_name) {
            if let Ok(path) = which::which(&compiler_path) {
                debug!(
                    "Using compiler from env var {}: {}",
                    env_var_name,
                    path.display()
                );
                return Ok(path);
            }
            debug!(
                "Env var {} points to missing compiler: {}",
                env_var_name, compiler_path
            );
        }
    }

    debug!("Searching PATH for '{name}'");
    which::which(name).map_err(|e| {
        HopsError::BuildEnvError(format!("Failed to find compiler '{name}' on PATH: {e}"))
    })
}

/// Identifies the compiler from its `--version` banner.
pub fn parse_compiler_banner(banner: &str) -> Option<Compiler> {
    let first_line = banner.lines().next()?.to_lowercase();
    let family = if first_line.contains("clang") {
        CompilerFamily::Clang
    } else if first_line.contains("gcc")
        || first_line.contains("g++")
        || banner.contains("Free Software Foundation")
    {
        CompilerFamily::Gcc
    } else {
        CompilerFamily::Unknown
    };

    // "Apple clang version 15.0.0 (...)", "gcc (Debian 12.2.0-14) 12.2.0"
    let version = match first_line.split_once("version ") {
        Some((_, rest)) => rest.split_whitespace().next(),
        None => first_line.split_whitespace().rev().find(|t| {
            t.chars().next().is_some_and(|c| c.is_ascii_digit()) && t.contains('.')
        }),
    }?;
    let version = version
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .filter(|v| !v.is_empty())?;
    Some(Compiler {
        family,
        version: ToolVersion::parse(version).ok()?,
    })
}

pub fn detect_compiler() -> Result<Compiler> {
    let cc = find_compiler("cc")?;
    let output = Command::new(&cc)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| HopsError::BuildEnvError(format!("Failed to run {}: {e}", cc.display())))?;
    let banner = String::from_utf8_lossy(&output.stdout);
    let compiler = parse_compiler_banner(&banner).ok_or_else(|| {
        HopsError::BuildEnvError(format!(
            "Could not identify compiler {} from '{}'",
            cc.display(),
            banner.lines().next().unwrap_or_default()
        ))
    })?;
    debug!("Detected compiler: {} ({})", compiler, cc.display());
    Ok(compiler)
}

pub fn get_macos_version() -> Option<String> {
    if !cfg!(target_os = "macos") {
        return None;
    }
    let output = Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()?;
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!version.is_empty()).then_some(version)
}

/// The platform of this machine with its default compiler.
pub fn host_platform() -> Result<Platform> {
    let mut platform = Platform::host(detect_compiler()?);
    platform.os_version = get_macos_version();
    Ok(platform)
}
