pub mod config;
pub mod context;
pub mod runtime;
pub mod telemetry;

pub use config::WorkerConfig;
pub use context::WorkerContext;
pub use runtime::{Platform, PlatformRuntime, ServiceRegistration};
