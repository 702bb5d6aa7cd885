// hops-common/src/dependency/mod.rs
pub mod definition;
pub mod requirement;
pub mod resolver;

pub use definition::{Dependency, DependencyExt, DependencyTag};
pub use requirement::Requirement;
pub use resolver::{
    DependencyResolver, ResolutionContext, ResolutionStatus, ResolvedGraph, ResolvedNode,
    ResolvedRequirement,
};
