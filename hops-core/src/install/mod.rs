// hops-core/src/install/mod.rs
pub mod materializer;

pub use materializer::{
    materialize, InstallReceipt, InstallationLayout, LinkRecord, MaterializeRequest,
};
