// hops-common/src/formulary.rs
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::config::Config;
use super::error::{HopsError, Result};
use super::model::formula::Formula;

/// Loads formulas by name from formula directories and keeps parsed copies.
#[derive(Debug)]
pub struct Formulary {
    dirs: Vec<PathBuf>,
    parsed_cache: Mutex<HashMap<String, Arc<Formula>>>,
}

impl Formulary {
    pub fn new(config: &Config) -> Self {
        Self::from_dirs(config.formula_dirs.clone())
    }

    pub fn from_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            parsed_cache: Mutex::new(HashMap::new()),
        }
    }

    /// A formulary holding only the given, already validated formulas.
    pub fn from_formulas(formulas: impl IntoIterator<Item = Formula>) -> Self {
        let cache = formulas
            .into_iter()
            .map(|f| (f.name.clone(), Arc::new(f)))
            .collect();
        Self {
            dirs: Vec::new(),
            parsed_cache: Mutex::new(cache),
        }
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<Formula>>>> {
        self.parsed_cache
            .lock()
            .map_err(|_| HopsError::Generic("formula cache lock poisoned".to_string()))
    }

    pub fn load_formula(&self, name: &str) -> Result<Arc<Formula>> {
        if let Some(formula) = self.cache()?.get(name) {
            debug!("Loaded formula '{}' from parsed cache.", name);
            return Ok(Arc::clone(formula));
        }

        let path = self
            .dirs
            .iter()
            .map(|dir| dir.join(format!("{name}.json")))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                HopsError::NotFound(format!(
                    "No formula named '{name}' in {}",
                    self.dirs
                        .iter()
                        .map(|d| d.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })?;

        let formula = Formula::load(&path)?;
        if formula.name != name {
            return Err(HopsError::malformed(
                name,
                format!(
                    "{} declares the name '{}'",
                    path.display(),
                    formula.name
                ),
            ));
        }
        debug!(
            "Successfully loaded formula '{}' version {}",
            formula.name,
            formula.version_str_full()
        );

        let formula = Arc::new(formula);
        self.cache()?
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&formula));
        Ok(formula)
    }

    /// Names of all formulas available in the formula directories or cache.
    pub fn available(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.cache()?.keys().cloned().collect();
        for dir in &self.dirs {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMULA: &str = r#"{
        "name": "hello",
        "version": "2.12",
        "source": {"url": "https://ftp.gnu.org/gnu/hello/hello-2.12.tar.gz",
                   "sha256": "cf04af86dc085268c5f4470fbae49b18afbc221b78096aab842d934a76bad0ab"}
    }"#;

    #[test]
    fn loads_and_caches_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("hello.json"), FORMULA).unwrap();
        let formulary = Formulary::from_dirs(vec![tmp.path().to_path_buf()]);

        let first = formulary.load_formula("hello").unwrap();
        fs::remove_file(tmp.path().join("hello.json")).unwrap();
        let second = formulary.load_formula("hello").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(formulary.available().unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn missing_formula_is_not_found() {
        let formulary = Formulary::from_dirs(vec![]);
        assert!(matches!(
            formulary.load_formula("nope"),
            Err(HopsError::NotFound(_))
        ));
    }

    #[test]
    fn file_name_must_match_formula_name() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("other.json"), FORMULA).unwrap();
        let formulary = Formulary::from_dirs(vec![tmp.path().to_path_buf()]);
        assert!(matches!(
            formulary.load_formula("other"),
            Err(HopsError::MalformedFormula { .. })
        ));
    }
}
