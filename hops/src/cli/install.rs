// hops/src/cli/install.rs
use clap::Args;
use colored::Colorize;
use hops_common::error::{HopsError, Result, VerificationFailure};
use hops_common::Config;
use hops_core::InstallOptions;
use tracing::instrument;

use super::context::Session;
use super::OptionArgs;

#[derive(Debug, Args)]
pub struct InstallArgs {
    name: String,

    #[command(flatten)]
    options: OptionArgs,

    /// Keep the build directory after a successful install
    #[arg(long)]
    keep_tmp: bool,

    /// Run the formula's verification after installing
    #[arg(long)]
    test: bool,
}

impl InstallArgs {
    pub fn options(&self) -> &OptionArgs {
        &self.options
    }

    #[instrument(skip(self, config), fields(target = %self.name))]
    pub async fn run(&self, config: &Config) -> Result<()> {
        let session = Session::new(config, self.options.selection()?, self.test)?;
        let graph = session.resolve(&self.name)?;
        let pending: Vec<&str> = graph.to_build().map(|n| n.name()).collect();
        println!(
            "{} {} ({} to build: {})",
            "==>".blue().bold(),
            format!("Installing {}", self.name).bold(),
            pending.len(),
            pending.join(", ")
        );

        let pipeline = session.pipeline()?;
        let options = InstallOptions {
            keep_tmp: self.keep_tmp,
            run_tests: self.test,
        };
        let outcomes = match pipeline
            .install_graph(&graph, &session.configuration, options)
            .await
        {
            Ok(outcomes) => outcomes,
            Err(err) => {
                report_failure(&err);
                if let HopsError::StepFailure(failure) = &err {
                    if let Some(node) = graph.get(&failure.formula) {
                        let layout = pipeline.layout_for(node, &session.configuration)?;
                        eprintln!(
                            "{} build directory left at {}",
                            "Note:".yellow().bold(),
                            layout.build_root.display()
                        );
                    }
                }
                return Err(err);
            }
        };

        for outcome in &outcomes {
            println!(
                "{} {} {} ({} files)",
                "==>".green().bold(),
                outcome.formula.bold(),
                outcome.layout.keg.display(),
                outcome.layout.file_count()
            );
            for warning in &outcome.build.warnings {
                println!("  {} {}", "Warning:".yellow(), warning);
            }
            if let Some(report) = &outcome.verification {
                println!("  {} {} checks passed", "Tested:".green(), report.actions_run);
            }
        }
        if let Some(caveats) = graph.root().and_then(|n| n.formula.caveats.as_deref()) {
            println!("{} {}", "==>".blue().bold(), "Caveats".bold());
            println!("{}", caveats.trim_end());
        }
        Ok(())
    }
}

/// Prints the command and output tail of a failed step or test.
pub fn report_failure(err: &HopsError) {
    let (command, tail) = match err {
        HopsError::StepFailure(failure) => (&failure.command_line, &failure.output_tail),
        HopsError::VerificationFailure(failure) => match failure.as_ref() {
            VerificationFailure::Exercise {
                command_line,
                output_tail,
                ..
            } => (command_line, output_tail),
            VerificationFailure::Auxiliary { .. } => return,
        },
        _ => return,
    };
    eprintln!("{} {}", "Command:".red().bold(), command);
    if !tail.is_empty() {
        eprintln!("{}", "Last output:".red().bold());
        for line in tail {
            eprintln!("  {line}");
        }
    }
}
