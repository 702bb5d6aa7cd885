// hops-net/src/lib.rs
pub mod http;
pub mod validation;

pub use http::CachingFetcher;
pub use validation::validate_url;
