//! Domain model, scheduling math, configuration, and durable storage for the AI task
//! scheduling core. Everything in this crate is synchronous and has no opinion about
//! which async runtime drives it; `scheduler-worker` and `scheduler-server` build the
//! runtime-facing pieces on top.

pub mod broker;
pub mod config;
pub mod defaults;
pub mod error;
pub mod model;
pub mod schedule;
pub mod store;
pub mod utils;

pub use broker::{Broker, Job, SqliteBroker};
pub use config::Config;
pub use error::{Result, SchedulerError};
pub use model::*;
pub use store::{SqliteTaskStore, TaskStore};
