//! Administrative command console: a retrying, auto-connecting command engine over one
//! long-lived pwsh session, plus the resolver that decides which modules that session needs.

pub mod auth;
pub mod capability;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod notify;
pub mod printer;
pub mod process;
pub mod resolver;

pub use engine::{CommandEngine, EngineSettings};
pub use error::{EngineError, EngineResult};
pub use execution::{CommandRequest, CommandResult};
pub use resolver::{AvailabilityMap, DependencyResolver};
