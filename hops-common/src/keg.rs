// hops-common/src/keg.rs
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use super::config::Config;
use super::error::Result;

/// Represents information about an installed package (Keg).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledKeg {
    pub name: String,
    pub version_str: String,
    pub path: PathBuf,
}

/// Read-only view of what is already installed.
pub trait InstalledRegistry: Send + Sync {
    /// The newest installed keg of `name`, if any.
    fn installed_keg(&self, name: &str) -> Result<Option<InstalledKeg>>;

    /// Stable `opt/<name>` path of a formula, whether or not it exists yet.
    fn opt_path(&self, name: &str) -> PathBuf;
}

/// Manages querying installed packages in the Cellar.
#[derive(Debug, Clone)]
pub struct KegRegistry {
    config: Config,
}

impl KegRegistry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn formula_cellar_path(&self, name: &str) -> PathBuf {
        self.config.cellar_dir().join(name)
    }

    pub fn get_installed_keg(&self, name: &str) -> Result<Option<InstalledKeg>> {
        let formula_dir = self.formula_cellar_path(name);
        if !formula_dir.is_dir() {
            debug!("[KEG_REGISTRY:{}] no cellar directory at {}", name, formula_dir.display());
            return Ok(None);
        }

        let mut kegs = self.kegs_in(name, &formula_dir)?;
        kegs.sort_by(|a, b| compare_versions(&a.version_str, &b.version_str));
        let latest = kegs.pop();
        if let Some(keg) = &latest {
            debug!(
                "[KEG_REGISTRY:{}] latest keg: {} ({})",
                name,
                keg.version_str,
                keg.path.display()
            );
        }
        Ok(latest)
    }

    pub fn list_installed_kegs(&self) -> Result<Vec<InstalledKeg>> {
        let cellar_dir = self.config.cellar_dir();
        debug!("[KEG_REGISTRY] scanning cellar: {}", cellar_dir.display());
        if !cellar_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut installed = Vec::new();
        for entry in fs::read_dir(&cellar_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("[KEG_REGISTRY] error reading cellar entry: {}. Skipping.", e);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            installed.extend(self.kegs_in(&name, &path)?);
        }
        installed.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| compare_versions(&a.version_str, &b.version_str))
        });
        Ok(installed)
    }

    fn kegs_in(&self, name: &str, formula_dir: &std::path::Path) -> Result<Vec<InstalledKeg>> {
        let mut kegs = Vec::new();
        for entry in fs::read_dir(formula_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(
                        "[KEG_REGISTRY:{}] error reading entry in {}: {}. Skipping.",
                        name,
                        formula_dir.display(),
                        e
                    );
                    continue;
                }
            };
            let path = entry.path();
            // A keg without a receipt is a half-finished install.
            if !path.is_dir() || !path.join(crate::RECEIPT_FILENAME).is_file() {
                continue;
            }
            if let Some(version) = path.file_name().and_then(|n| n.to_str()) {
                kegs.push(InstalledKeg {
                    name: name.to_string(),
                    version_str: version.to_string(),
                    path: path.clone(),
                });
            }
        }
        Ok(kegs)
    }
}

impl InstalledRegistry for KegRegistry {
    fn installed_keg(&self, name: &str) -> Result<Option<InstalledKeg>> {
        self.get_installed_keg(name)
    }

    fn opt_path(&self, name: &str) -> PathBuf {
        self.config.formula_opt_path(name)
    }
}

/// Orders dotted versions numerically where possible, lexically otherwise.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '_', '-']).map(str::to_string).collect()
    };
    let (pa, pb) = (split(a), split(b));
    for (x, y) in pa.iter().zip(pb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    pa.len().cmp(&pb.len())
}
