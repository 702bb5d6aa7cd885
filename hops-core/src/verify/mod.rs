// hops-core/src/verify/mod.rs
//! Smoke tests against an installed keg, with scoped auxiliary services.

pub mod runner;
mod scope;

pub use runner::{VerificationReport, VerificationRequest, VerificationRunner};
