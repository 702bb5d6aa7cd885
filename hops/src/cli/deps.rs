// hops/src/cli/deps.rs
use clap::Args;
use colored::Colorize;
use hops_common::dependency::ResolutionStatus;
use hops_common::error::Result;
use hops_common::Config;

use super::context::Session;
use super::OptionArgs;

#[derive(Args, Debug)]
pub struct Deps {
    name: String,

    #[command(flatten)]
    options: OptionArgs,

    /// Include test-only dependencies of the formula
    #[arg(long)]
    include_test: bool,
}

impl Deps {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let session = Session::new(config, self.options.selection()?, self.include_test)?;
        let graph = session.resolve(&self.name)?;
        for node in &graph.order {
            let status = match node.status {
                ResolutionStatus::Installed => "installed".green(),
                ResolutionStatus::Missing => "missing".yellow(),
                ResolutionStatus::Requested => "requested".blue(),
            };
            let options = node.options.canonical();
            println!(
                "{} {} [{}] {}{}",
                node.name().bold(),
                node.formula.version_str_full(),
                node.accumulated_tags,
                status,
                if options.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", options.join(", "))
                }
            );
        }
        for resolved in &graph.requirements {
            println!(
                "{} {} (required by {})",
                "requires".dimmed(),
                resolved.requirement.name,
                resolved.required_by
            );
        }
        Ok(())
    }
}
