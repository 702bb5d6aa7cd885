// hops-core/src/lib.rs
//! Build, install and verification engine for hops formulas.

pub mod build;
pub mod devtools;
pub mod install;
pub mod pipeline;
pub mod verify;

pub use build::{BuildExecutor, BuildPlan, BuildReport};
pub use install::{materialize, InstallationLayout};
pub use pipeline::{InstallOptions, InstallOutcome, InstallPipeline};
pub use verify::{VerificationReport, VerificationRunner};
