// hops/src/cli/plan.rs
use std::collections::HashMap;

use clap::Args;
use colored::Colorize;
use hops_common::error::{HopsError, Result};
use hops_common::Config;

use super::context::Session;
use super::OptionArgs;

#[derive(Args, Debug)]
pub struct PlanArgs {
    name: String,

    #[command(flatten)]
    options: OptionArgs,

    /// Also print the build environment
    #[arg(long)]
    env: bool,
}

impl PlanArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let session = Session::new(config, self.options.selection()?, false)?;
        let graph = session.resolve(&self.name)?;
        let node = graph
            .root()
            .ok_or_else(|| HopsError::NotFound(self.name.clone()))?;
        let pipeline = session.pipeline()?;
        let plan = pipeline.plan(&graph, node, &session.configuration, &HashMap::new())?;

        println!(
            "{} {} {} ({})",
            "==>".blue().bold(),
            plan.formula.bold(),
            plan.version,
            node.options.canonical().join(", ")
        );
        println!("source:  {}", plan.source.url);
        for resource in &plan.resources {
            println!("resource {}: {}", resource.name, resource.request.url);
        }
        println!("staging: {}", plan.layout.staging.display());
        println!("keg:     {}", plan.layout.keg.display());
        for (i, step) in plan.steps.iter().enumerate() {
            let marker = if step.best_effort { " (best effort)" } else { "" };
            println!(
                "{:>3}. [{:?}] {}{}",
                i + 1,
                step.phase,
                step.name.bold(),
                marker.dimmed()
            );
            println!("     {}", step.command.display_line());
            if let Some(cwd) = &step.command.cwd {
                println!("     {} {}", "in".dimmed(), cwd.display());
            }
        }
        if self.env {
            println!("{} {}", "==>".blue().bold(), "Environment".bold());
            for (key, value) in plan.env.vars() {
                println!("{key}={value}");
            }
        }
        Ok(())
    }
}
