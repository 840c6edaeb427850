pub mod admission;
pub mod client_key;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod response;
pub mod server;
pub mod shutdown;
pub mod token_bucket;

pub use admission::{Admission, Decision, DenyReason};
pub use config::Config;
pub use error::{Error, Result};
pub use registry::LimiterRegistry;
pub use server::{create_app, Server};
pub use shutdown::{DrainOutcome, DrainReport, ShutdownCoordinator, ShutdownState};
pub use token_bucket::{BucketSettings, TokenBucket};
