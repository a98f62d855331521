//! Shared foundation for the chart export server.
//!
//! This crate holds everything the other crates agree on: the error
//! taxonomy, the layered configuration, the normalized render request,
//! output format mapping, the periodic-task registry, and log-level
//! plumbing. It has no knowledge of browsers or HTTP.

pub mod config;
pub mod error;
pub mod format;
pub mod logging;
pub mod request;
pub mod timers;

pub use config::Config;
pub use error::{ExportError, ExportResult};
pub use logging::LogLevel;
pub use format::{Artifact, ChartConstructor, OutputFormat};
pub use request::{RenderRequest, RequestKind, Resources};
pub use timers::TimerRegistry;
