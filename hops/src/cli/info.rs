// hops/src/cli/info.rs
use clap::Args;
use colored::Colorize;
use hops_common::dependency::{DependencyExt, DependencyTag};
use hops_common::error::Result;
use hops_common::formulary::Formulary;
use hops_common::keg::KegRegistry;
use hops_common::Config;

#[derive(Args, Debug)]
pub struct Info {
    name: String,

    /// Print the formula as JSON
    #[arg(long)]
    json: bool,
}

impl Info {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let formula = Formulary::new(config).load_formula(&self.name)?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(formula.as_ref())?);
            return Ok(());
        }

        println!(
            "{} {}",
            formula.name().green().bold(),
            formula.version_str_full()
        );
        if let Some(desc) = &formula.desc {
            println!("{desc}");
        }
        if let Some(homepage) = &formula.homepage {
            println!("{}", homepage.blue().underline());
        }
        println!("{} {}", "Source:".bold(), formula.source.url);

        let options = formula.declared_options();
        if !options.is_empty() {
            println!("{}", "Options:".bold());
            for option in options {
                let detail = match (option.values.is_empty(), &option.default) {
                    (false, Some(default)) => {
                        format!(" [{}] (default {default})", option.values.join("|"))
                    }
                    (false, None) => format!(" [{}]", option.values.join("|")),
                    _ => String::new(),
                };
                println!(
                    "  {}{}  {}",
                    option.name,
                    detail,
                    option.desc.as_deref().unwrap_or_default().dimmed()
                );
            }
        }
        let groups = [
            ("Build dependencies:", formula.dependencies.build_time()),
            ("Runtime dependencies:", formula.dependencies.runtime()),
            (
                "Test dependencies:",
                formula.dependencies.filter_by_tags(
                    DependencyTag::TEST,
                    DependencyTag::BUILD | DependencyTag::RUNTIME,
                ),
            ),
        ];
        for (title, deps) in groups {
            if deps.is_empty() {
                continue;
            }
            println!("{}", title.bold());
            for dep in deps {
                let conditional = if dep.when.is_some() { " (conditional)" } else { "" };
                println!("  {} [{}]{}", dep.name, dep.tags, conditional);
            }
        }
        if !formula.requirements.is_empty() {
            println!("{}", "Requirements:".bold());
            for requirement in &formula.requirements {
                println!("  {} ({})", requirement.name, requirement.hint());
            }
        }
        for failure in &formula.fails_with {
            let bound = failure
                .build
                .as_ref()
                .map(|b| format!(" <= {b}"))
                .unwrap_or_default();
            println!(
                "{} {}{}: {}",
                "Fails with".yellow(),
                failure.compiler,
                bound,
                failure.cause.as_deref().unwrap_or("no cause given")
            );
        }

        match KegRegistry::new(config.clone()).get_installed_keg(formula.name())? {
            Some(keg) => println!("{} {}", "Installed:".bold(), keg.path.display()),
            None => println!("{}", "Not installed".dimmed()),
        }
        if let Some(caveats) = &formula.caveats {
            println!("{}", "Caveats:".bold());
            println!("{}", caveats.trim_end());
        }
        Ok(())
    }
}
