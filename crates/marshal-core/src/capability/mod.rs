//! Capability dispatch.
//!
//! Maps call names to [`Capability`] implementations and routes each call
//! through the safeguard, origin denials, approval and (optionally) the
//! exclusive slot.

mod definition;
mod filter;
pub mod hints;
mod registry;
pub mod safeguard;

pub use definition::{Capability, CapabilityError, CapabilityInfo, ToolCall, ToolResult};
pub use filter::{PermissionFilter, Platform};
pub use registry::{CapabilityRegistry, ChangeListener};
