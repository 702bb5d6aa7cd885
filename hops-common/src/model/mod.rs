// hops-common/src/model/mod.rs
pub mod condition;
pub mod configuration;
pub mod formula;
pub mod layout;
pub mod options;
pub mod platform;
pub mod verify;

pub use condition::{Condition, EvalContext};
pub use configuration::Configuration;
pub use formula::Formula;
pub use options::{EnabledOptions, OptionDecl, OptionSelection};
pub use platform::{Arch, Compiler, CompilerFamily, OsFamily, Platform, ToolVersion};
