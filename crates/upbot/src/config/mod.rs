//! Process configuration.
//!
//! Defaults live in code, an optional TOML file can replace any of them and
//! environment variables override both.

mod env;
mod methods;
mod types;

pub use env::CONFIG_PATH_VAR;
pub use types::{QueueSettings, SchedulerSettings, Settings, StoreSettings, WorkerSettings};
