//! Background process sessions.
//!
//! A [`ProcessRegistry`] spawns shell commands, drains their output into
//! per-session buffers, and keeps finished sessions around until the
//! sweeper reclaims them.

mod buffer;
mod registry;
mod session;
mod slug;

pub use registry::{Partition, ProcessConfig, ProcessError, ProcessRegistry};
pub use session::{PendingOutput, Session, SessionId, SessionSnapshot, SessionStatus, StreamKind};
pub use slug::create_session_slug;
