//! # marshal-core
//!
//! Execution control plane for an autonomous agent: decides whether an
//! action may run, routes it to its capability, and supervises long-lived
//! shell commands as background sessions.
//!
//! This crate is framework-agnostic and can be used by:
//! - The HTTP/WebSocket server (`marshal-http`)
//! - The CLI daemon (`marshal-daemon`)
//!
//! ## Key Concepts
//!
//! - **Session**: One spawned command with bounded output buffers
//! - **Origin**: Who issued a call; some origins can never run some capabilities
//! - **Capability**: A named, schema-described unit of behavior
//! - **Safeguard**: An unconditional block on catastrophic commands

pub mod approval;
pub mod capability;
pub mod config;
pub mod context;
pub mod event_bus;
pub mod paths;
pub mod process;
pub mod shell;
pub mod tools;

// Re-export commonly used types
pub use approval::{ApprovalPolicy, Decision, Origin};
pub use capability::{Capability, CapabilityRegistry, ToolCall, ToolResult};
pub use config::{load_config, save_config, ControlPlaneConfig};
pub use context::{ControlPlane, ControlPlaneBuilder};
pub use event_bus::{BroadcastEvent, EventBus};
pub use process::{ProcessRegistry, Session, SessionId, SessionSnapshot};
