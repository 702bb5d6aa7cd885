// hops/src/cli/list.rs
use clap::Args;
use colored::Colorize;
use hops_common::error::Result;
use hops_common::keg::KegRegistry;
use hops_common::Config;

#[derive(Args, Debug)]
pub struct List {
    /// Show keg paths
    #[arg(long)]
    pub paths: bool,
}

impl List {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let kegs = KegRegistry::new(config.clone()).list_installed_kegs()?;
        if kegs.is_empty() {
            println!("{}", "0 formulas installed".yellow());
            return Ok(());
        }
        for keg in &kegs {
            if self.paths {
                println!("{} {} {}", keg.name.bold(), keg.version_str, keg.path.display());
            } else {
                println!("{} {}", keg.name.bold(), keg.version_str);
            }
        }
        println!("{}", format!("{} formulas installed", kegs.len()).dimmed());
        Ok(())
    }
}
