//! Billy Lifecycle - governed upgrades for a vendored package
//!
//! Fetches a new release of the managed package, builds it in isolation,
//! validates it without touching production and records promotion only
//! under explicit human authorization. Every mutation is persisted
//! atomically and journaled to an append-only audit log.

pub mod approval;
pub mod audit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fileops;
pub mod github;
pub mod lifecycle;
pub mod lock;
pub mod mock;
pub mod process;
pub mod schema;
pub mod staging;
pub mod state;
pub mod telemetry;
pub mod timeout;
pub mod validator;
pub mod version;

pub use config::{LifecycleConfig, LoadedConfig};
pub use dispatch::dispatch;
pub use error::LifecycleError;
pub use lifecycle::{Collaborators, Lifecycle, LifecyclePaths};
pub use state::{LifecycleState, StateRecord, StateStore};
pub use version::PackageVersion;
