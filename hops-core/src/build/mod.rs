// hops-core/src/build/mod.rs
pub mod env;
pub mod executor;
pub mod plan;

pub use env::{BuildEnvironment, DependencyPrefix};
pub use executor::{BuildExecutor, BuildReport, StepRecord};
pub use plan::{
    build_key, compute_plan, keg_key, BuildLayout, BuildPlan, PlanInputs, PlannedStep,
};
