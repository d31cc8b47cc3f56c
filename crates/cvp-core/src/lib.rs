//! cvp-core: shared types for the content inspection proxy: session ids,
//! the coordinator/worker command vocabulary, verdicts, peer wire format,
//! and configuration. All other cvp crates depend on this one.

pub mod command;
pub mod config;
pub mod verdict;
pub mod wire;

pub use command::{Command, Message, Payload, SessionId};
pub use verdict::{FilenamePrefixPolicy, Opinion, RequestParams, Verdict, VerdictPolicy};
