//! Lifecycle Protocol Types
//!
//! Defines the command surface consumed by front-ends (CLI, chat, HTTP):
//! authority levels, the tagged command enum, stable reason codes and the
//! structured response envelope.

pub mod authority;
pub mod command;
pub mod error;
pub mod response;

pub use authority::{Actor, ActorParseError, Authority, Requirement};
pub use command::{Command, CommandRequest, LockScope};
pub use error::{CommandError, ErrorClass, ReasonCode};
pub use response::CommandResponse;

/// Version of the command envelope understood by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;
