// hops-common/src/model/configuration.rs
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::options::{EnabledOptions, OptionSelection};
use super::platform::Platform;
use crate::error::Result;

/// Everything a single build invocation is parameterized by besides the
/// formulas themselves.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Options requested for the root formula.
    pub selection: OptionSelection,
    pub platform: Platform,
    pub jobs: usize,
    /// Follow test-only dependency edges.
    pub include_test: bool,
}

#[derive(Serialize)]
struct HashInput<'a> {
    options: &'a EnabledOptions,
    platform: &'a Platform,
}

impl Configuration {
    pub fn new(selection: OptionSelection, platform: Platform, jobs: usize) -> Self {
        Self {
            selection,
            platform,
            jobs: jobs.max(1),
            include_test: false,
        }
    }

    /// Stable hex digest of the effective options of one formula together
    /// with the platform. Builds with equal hashes produce the same keg.
    pub fn build_hash(&self, options: &EnabledOptions) -> Result<String> {
        let canonical = serde_json::to_vec(&HashInput {
            options,
            platform: &self.platform,
        })?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::options::OptionDecl;
    use crate::model::platform::{Compiler, CompilerFamily, ToolVersion};

    fn configuration() -> Configuration {
        let compiler = Compiler {
            family: CompilerFamily::Clang,
            version: ToolVersion::parse("15.0.0").unwrap(),
        };
        Configuration::new(OptionSelection::default(), Platform::host(compiler), 0)
    }

    #[test]
    fn jobs_are_at_least_one() {
        assert_eq!(configuration().jobs, 1);
    }

    #[test]
    fn build_hash_depends_on_options() {
        let config = configuration();
        let declared = vec![OptionDecl::flag("with-check")];
        let off = EnabledOptions::resolve("r", &declared, &OptionSelection::default()).unwrap();
        let on = EnabledOptions::resolve(
            "r",
            &declared,
            &OptionSelection::parse(["with-check"]).unwrap(),
        )
        .unwrap();

        let a = config.build_hash(&off).unwrap();
        assert_eq!(a, config.build_hash(&off).unwrap());
        assert_ne!(a, config.build_hash(&on).unwrap());
        assert_eq!(a.len(), 64);
    }
}
