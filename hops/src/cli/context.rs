// hops/src/cli/context.rs
use std::sync::Arc;

use hops_common::dependency::{DependencyResolver, ResolutionContext, ResolvedGraph};
use hops_common::error::Result;
use hops_common::formulary::Formulary;
use hops_common::keg::KegRegistry;
use hops_common::model::{Configuration, OptionSelection};
use hops_common::Config;
use hops_core::devtools;
use hops_core::InstallPipeline;
use hops_net::CachingFetcher;
use tracing::debug;

/// What every resolving command needs: formulas, installed kegs and the
/// host configuration.
pub struct Session {
    pub config: Config,
    pub formulary: Formulary,
    pub registry: KegRegistry,
    pub configuration: Configuration,
}

impl Session {
    pub fn new(config: &Config, selection: OptionSelection, include_test: bool) -> Result<Self> {
        let platform = devtools::host_platform()?;
        debug!(
            "Host platform: {} {} with {}",
            platform.os.as_str(),
            platform.arch.as_str(),
            platform.compiler
        );
        let mut configuration = Configuration::new(selection, platform, config.make_jobs);
        configuration.include_test = include_test;
        Ok(Self {
            config: config.clone(),
            formulary: Formulary::new(config),
            registry: KegRegistry::new(config.clone()),
            configuration,
        })
    }

    pub fn resolve(&self, name: &str) -> Result<ResolvedGraph> {
        DependencyResolver::new(ResolutionContext {
            formulary: &self.formulary,
            registry: &self.registry,
            configuration: &self.configuration,
        })
        .resolve(name)
    }

    pub fn pipeline(&self) -> Result<InstallPipeline> {
        let fetcher = CachingFetcher::from_config(&self.config)?;
        Ok(InstallPipeline::new(
            self.config.clone(),
            Arc::new(hops_aio::SystemRunner),
            Arc::new(fetcher),
        ))
    }
}
