pub mod args;
pub mod config;
pub mod error;
pub mod error_payload;
pub mod http;
mod launcher;
pub mod logs;
pub mod middleware;
pub mod models;
pub mod port_alloc;
pub mod registry;
pub mod sd;
pub mod state;
pub mod supervisor;
pub mod telemetry;
mod terminator;
pub mod worker;

pub use config::{AgentConfig, SdSettings, SupervisorSettings};
pub use error::SupervisorError;
pub use launcher::worker_args;
pub use port_alloc::PortMapping;
pub use sd::SdSupervisor;
pub use supervisor::Supervisor;
pub use terminator::StopTimings;
