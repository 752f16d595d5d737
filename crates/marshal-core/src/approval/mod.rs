//! Approval policy engine.
//!
//! Decides whether a call needs human or remote sign-off:
//! - Origin denials (checked first by the dispatcher, never relaxed)
//! - Approval level and ask mode
//! - Command allow-list, extended at runtime by "approve always"

mod allowlist;
mod command;
mod origin;
mod policy;

pub use allowlist::{Allowlist, DEFAULT_ALLOWLIST};
pub use command::{has_side_channel, match_keys, split_segments, tokenize};
pub use origin::{Origin, OriginDeny, BUILTIN_DENIED};
pub use policy::{
    ApprovalError, ApprovalLevel, ApprovalPolicy, ApprovalRequest, AskMode, AutonomousProbe,
    Decision, PolicyConfig, Prompter, RemoteApprover,
};
