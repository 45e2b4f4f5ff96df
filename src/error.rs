//! # Error Handling for the Grimoire VM
//!
//! Two planes, which never mix:
//!
//! - [`HostError`] covers VM *misuse*: unknown variable names, type-mask
//!   mismatches, unresolved primitives, malformed bytecode. These are
//!   surfaced to the embedding host immediately as `Result` errors.
//! - Script-level exceptions are plain string messages ([`Exception`]).
//!   They are raised by instructions (or by `raise` in script code) and
//!   propagate through the unwinder: handler PCs first, then deferred
//!   blocks, then caller frames, escalating to a VM panic at the root.
//!
//! The canonical exception names the VM itself raises live in
//! [`exception`]; user code can raise arbitrary messages.

use thiserror::Error;

/// A script-plane exception: the message string carried while a coroutine
/// unwinds. Caught by `catch`, which leaves the message on the string stack.
pub type Exception = String;

/// Exception names raised by the VM itself.
pub mod exception {
    /// Division or remainder where the divisor is the type's additive identity.
    pub const ZERO_DIVISION: &str = "ZeroDivisionError";
    /// Array index outside `[0, len)` after a single negative wrap.
    pub const INDEX: &str = "IndexError";
    /// Field or container access through a null receiver.
    pub const NULL: &str = "NullError";
    /// Send or receive on a closed channel outside a select block.
    pub const CHANNEL: &str = "ChannelError";
    /// `try_channel` while a previous case is still being evaluated.
    pub const SELECT: &str = "SelectError";
}

/// Errors that indicate the *host* misused the VM. These never enter the
/// script-level exception machinery.
#[derive(Debug, Error, PartialEq)]
pub enum HostError {
    /// Variable name absent from the bytecode's variable table.
    #[error("unknown global variable '{0}'")]
    UnknownVariable(String),
    /// The variable exists but its type mask does not include the
    /// requested partition.
    #[error("global variable '{0}' does not hold the requested type")]
    VariableType(String),
    /// `spawn_event` or `push_context` named an event the bytecode
    /// does not define.
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    /// `spawn` requires a `main` event in the loaded bytecode.
    #[error("no 'main' entry point in the loaded bytecode")]
    MissingMain,
    /// The artifact references a primitive no registered library provides.
    #[error("primitive {index} refers to '{signature}', which no registered library provides")]
    UnresolvedPrimitive { index: usize, signature: String },
    /// A primitive signature string that does not parse.
    #[error("malformed primitive signature '{0}'")]
    BadSignature(String),
    /// Truncated or inconsistent bytecode image.
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(String),
    /// An operation that requires `load` to have been called first.
    #[error("no bytecode loaded")]
    NotLoaded,
}
