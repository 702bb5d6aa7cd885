// hops/src/cli.rs
//! Command-line argument structure.

use clap::{ArgAction, Args, Parser, Subcommand};
use hops_common::error::Result;
use hops_common::model::OptionSelection;
use hops_common::Config;

pub mod context;
pub mod deps;
pub mod info;
pub mod install;
pub mod list;
pub mod plan;

use crate::cli::deps::Deps;
use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::plan::PlanArgs;
use crate::cli::test::TestArgs;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "hops", bin_name = "hops")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build and install a formula and its missing dependencies
    Install(InstallArgs),
    /// Show the resolved dependency order
    Deps(Deps),
    /// Print the build steps without running anything
    Plan(PlanArgs),
    /// Run the verification of an installed formula
    Test(TestArgs),
    /// Describe a formula
    Info(Info),
    /// List installed kegs
    List(List),
}

impl Command {
    pub async fn run(&self, config: &Config) -> Result<()> {
        match self {
            Self::Install(command) => command.run(config).await,
            Self::Deps(command) => command.run(config).await,
            Self::Plan(command) => command.run(config).await,
            Self::Test(command) => command.run(config).await,
            Self::Info(command) => command.run(config).await,
            Self::List(command) => command.run(config).await,
        }
    }
}

/// Build options shared by the commands that resolve a formula.
#[derive(Args, Debug, Default, Clone)]
pub struct OptionArgs {
    /// Enable an optional feature (`--with check` selects `with-check`)
    #[arg(long = "with", value_name = "FEATURE")]
    pub with: Vec<String>,
    /// Disable a default feature (`--without tcltk` selects `without-tcltk`)
    #[arg(long = "without", value_name = "FEATURE")]
    pub without: Vec<String>,
    /// Set a choice option
    #[arg(long = "option", value_name = "NAME=VALUE")]
    pub option: Vec<String>,
}

impl OptionArgs {
    pub fn selection(&self) -> Result<OptionSelection> {
        let items = self
            .with
            .iter()
            .map(|f| format!("with-{f}"))
            .chain(self.without.iter().map(|f| format!("without-{f}")))
            .chain(self.option.iter().cloned());
        OptionSelection::parse(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_flags_become_a_selection() {
        let args = CliArgs::try_parse_from([
            "hops",
            "install",
            "r",
            "--with",
            "check",
            "--without",
            "tcltk",
            "--option",
            "blas=openblas",
        ])
        .unwrap();
        let Command::Install(install) = args.command else {
            panic!("expected install");
        };
        let selection = install.options().selection().unwrap();
        assert_eq!(
            selection.entries(),
            vec!["with-check", "without-tcltk", "blas=openblas"]
        );
    }

    #[test]
    fn malformed_option_is_rejected() {
        let options = OptionArgs {
            option: vec!["blas".to_string()],
            ..Default::default()
        };
        assert!(options.selection().is_err());
    }

    #[test]
    fn verbosity_is_global() {
        let args = CliArgs::try_parse_from(["hops", "deps", "plr", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }
}
