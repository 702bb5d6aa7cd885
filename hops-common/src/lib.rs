// hops-common/src/lib.rs
pub mod config;
pub mod dependency;
pub mod error;
pub mod fetch;
pub mod formulary;
pub mod keg;
pub mod model;
pub mod template;

/// Written last into every keg; its presence marks a complete install.
pub const RECEIPT_FILENAME: &str = "INSTALL_RECEIPT.json";
pub const MANIFEST_FILENAME: &str = "INSTALL_MANIFEST.json";

// Re-export key types
pub use config::Config;
pub use error::{HopsError, Result};
pub use model::Formula;
