// hops-core/src/pipeline.rs
//! Drives resolved formulas through build, install and verification.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hops_aio::{BuildLock, CommandRunner};
use hops_common::config::Config;
use hops_common::dependency::{ResolvedGraph, ResolvedNode};
use hops_common::error::{HopsError, Result};
use hops_common::fetch::Fetcher;
use hops_common::model::Configuration;
use tracing::{debug, info, instrument, warn};

use crate::build::env::{host_env, DependencyPrefix};
use crate::build::executor::{BuildExecutor, BuildReport};
use crate::build::plan::{
    build_key, compute_plan, keg_key, BuildLayout, BuildPlan, PlanInputs,
};
use crate::install::{materialize, InstallationLayout, MaterializeRequest};
use crate::verify::{VerificationReport, VerificationRequest, VerificationRunner};

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Keep the build directory after a successful install.
    pub keep_tmp: bool,
    /// Run the root formula's verification after installing it.
    pub run_tests: bool,
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub formula: String,
    pub build: BuildReport,
    pub layout: InstallationLayout,
    pub verification: Option<VerificationReport>,
}

pub struct InstallPipeline {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn Fetcher>,
    base_env: BTreeMap<String, String>,
}

impl InstallPipeline {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>, fetcher: Arc<dyn Fetcher>) -> Self {
        let mut base_env = host_env();
        base_env
            .entry("HOME".to_string())
            .or_insert_with(|| config.home_dir().display().to_string());
        Self {
            config,
            runner,
            fetcher,
            base_env,
        }
    }

    /// Environment that build and test environments are derived from.
    pub fn with_base_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Scratch directories the build of `node` uses.
    pub fn layout_for(
        &self,
        node: &ResolvedNode,
        configuration: &Configuration,
    ) -> Result<BuildLayout> {
        let hash = configuration.build_hash(&node.options)?;
        Ok(BuildLayout::for_formula(&self.config, &node.formula, &hash))
    }

    /// Install prefixes of everything `name` builds against.
    ///
    /// `built` holds kegs produced earlier in the same run.
    pub fn dependency_prefixes(
        &self,
        graph: &ResolvedGraph,
        name: &str,
        built: &HashMap<String, PathBuf>,
    ) -> Vec<DependencyPrefix> {
        graph
            .build_closure(name)
            .into_iter()
            .map(|(dep, tags)| {
                let prefix = built
                    .get(dep.name())
                    .or(dep.keg_path.as_ref())
                    .cloned()
                    .unwrap_or_else(|| dep.opt_path.clone());
                DependencyPrefix {
                    name: dep.name().to_string(),
                    prefix,
                    opt: dep.opt_path.clone(),
                    tags,
                }
            })
            .collect()
    }

    pub fn plan(
        &self,
        graph: &ResolvedGraph,
        node: &ResolvedNode,
        configuration: &Configuration,
        built: &HashMap<String, PathBuf>,
    ) -> Result<BuildPlan> {
        let layout = self.layout_for(node, configuration)?;
        let dependencies = self.dependency_prefixes(graph, node.name(), built);
        compute_plan(&PlanInputs {
            formula: &node.formula,
            options: &node.options,
            platform: &configuration.platform,
            dependencies: &dependencies,
            layout: &layout,
            jobs: configuration.jobs,
            base_env: &self.base_env,
            step_timeout: Some(self.config.step_timeout),
        })
    }

    /// Builds and installs every node of `graph` that is not installed yet,
    /// in resolution order. Stops at the first failure.
    pub async fn install_graph(
        &self,
        graph: &ResolvedGraph,
        configuration: &Configuration,
        options: InstallOptions,
    ) -> Result<Vec<InstallOutcome>> {
        let root = graph
            .root()
            .map(|n| n.name().to_string())
            .ok_or_else(|| HopsError::Generic("empty dependency graph".to_string()))?;
        let mut built = HashMap::new();
        let mut outcomes = Vec::new();
        for node in graph.to_build() {
            let test = options.run_tests && node.name() == root;
            let outcome = self
                .install_node(graph, node, configuration, &built, options.keep_tmp, test)
                .await?;
            built.insert(outcome.formula.clone(), outcome.layout.keg.clone());
            outcomes.push(outcome);
        }
        if outcomes.is_empty() {
            info!("==> Nothing to install for {}", root);
        }
        Ok(outcomes)
    }

    #[instrument(skip_all, fields(formula = %node.name()))]
    async fn install_node(
        &self,
        graph: &ResolvedGraph,
        node: &ResolvedNode,
        configuration: &Configuration,
        built: &HashMap<String, PathBuf>,
        keep_tmp: bool,
        run_test: bool,
    ) -> Result<InstallOutcome> {
        let formula = &node.formula;
        let hash = configuration.build_hash(&node.options)?;
        let key = build_key(formula.name(), &formula.version_str_full(), &hash);
        let _lock = BuildLock::acquire(&self.config.locks_dir(), &key).await?;
        debug!("Holding build lock {}", key);

        let plan = self.plan(graph, node, configuration, built)?;
        let executor = BuildExecutor::new(self.runner.clone(), self.fetcher.clone())
            .with_log_dir(self.config.formula_logs_dir(formula.name()));
        let build = executor.execute(&plan).await?;

        let dependencies = self.dependency_prefixes(graph, node.name(), built);
        let keg_lock = BuildLock::acquire(
            &self.config.locks_dir(),
            &keg_key(formula.name(), &formula.version_str_full()),
        )
        .await?;
        let layout = materialize(&MaterializeRequest {
            formula,
            options: &node.options,
            platform: &configuration.platform,
            staging: &plan.layout.staging,
            keg: &plan.layout.keg,
            opt: &plan.layout.opt,
            hops_prefix: &plan.layout.hops_prefix,
            dependencies: &dependencies,
            build_hash: &hash,
        })?;
        drop(keg_lock);

        if keep_tmp {
            info!("Keeping build directory {}", plan.layout.build_root.display());
        } else if let Err(e) = hops_aio::fs::remove_path(&plan.layout.build_root) {
            warn!(
                "Could not remove build directory {}: {}",
                plan.layout.build_root.display(),
                e
            );
        }

        let verification = if run_test {
            Some(self.verify(&layout, node, &dependencies, configuration).await?)
        } else {
            None
        };

        info!(
            "==> Installed {} {} to {}",
            formula.name(),
            formula.version_str_full(),
            layout.keg.display()
        );
        Ok(InstallOutcome {
            formula: formula.name().to_string(),
            build,
            layout,
            verification,
        })
    }

    /// Runs the verification procedure of an installed node.
    pub async fn verify(
        &self,
        layout: &InstallationLayout,
        node: &ResolvedNode,
        dependencies: &[DependencyPrefix],
        configuration: &Configuration,
    ) -> Result<VerificationReport> {
        let formula = &node.formula;
        let timeout = formula
            .test
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.test_timeout);
        VerificationRunner::new(self.runner.clone())
            .run(&VerificationRequest {
                formula,
                platform: &configuration.platform,
                layout,
                hops_prefix: self.config.hops_root(),
                dependencies,
                base_env: &self.base_env,
                timeout,
            })
            .await
    }
}
