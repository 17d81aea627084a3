//! Crate-wide error taxonomy.
//!
//! The dispatcher distinguishes two error channels, mirroring the original
//! emulator's `TheCPU.err` vs `fatalerr`/`leavedos` split:
//!
//! - [`RecoverableError`]: reported back to the guest or the calling backend,
//!   execution continues (e.g. an unimplemented opcode the interpreter can
//!   skip past, a DPMI protocol violation that just fails the call).
//! - [`FatalError`]: the core cannot continue. `loopstep`'s caller converts
//!   this into a process exit; nothing below the dispatcher recovers from it.

use std::collections::HashSet;
use thiserror::Error;

/// Errors that a single `loopstep` iteration or backend call can recover from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoverableError {
    /// A guest-visible exception the backend could not translate into a
    /// fault-router dispatch (e.g. an unrecognized vector).
    #[error("unhandled guest exception: vector {vector:#x}")]
    UnhandledException { vector: u8 },

    /// The active backend doesn't implement an instruction it decoded.
    #[error("emulation gap in {backend}: {detail}")]
    EmulationGap { backend: &'static str, detail: String },

    /// The guest violated a documented host protocol (bad DPMI call,
    /// HLT at an offset with no registered handler, etc).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Errors the core cannot continue past.
///
/// Corresponds to the C source's `leavedos(code)` — the exit code is
/// preserved so the embedder can report it the way dosemu2's shell wrapper
/// does.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// Host resource exhaustion: out of HLT offsets, coopth slots, JIT arena
    /// space, KVM memory slots, etc.
    #[error("host resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A backend failed to initialize or lost its execution context
    /// (e.g. KVM ioctl failure, ptrace attach failure).
    #[error("backend failure: {0}")]
    Backend(String),

    /// Explicit guest or host request to leave, with the dosemu2-style exit
    /// code (0 = clean, non-zero = error code propagated to the shell).
    #[error("leavedos({code})")]
    LeaveDos { code: i32 },
}

impl FatalError {
    pub fn leave(code: i32) -> Self {
        FatalError::LeaveDos { code }
    }
}

/// Top-level error returned across the dispatcher boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error(transparent)]
    Recoverable(#[from] RecoverableError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Deduplicates repeated fatal-error messages so a spinning fault doesn't
/// flood the log, matching the original `dosemu_error` dedup behavior.
#[derive(Default)]
pub struct ErrorDedup {
    seen: HashSet<String>,
}

impl ErrorDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a given message is seen, false on repeats.
    pub fn should_report(&mut self, message: &str) -> bool {
        self.seen.insert(message.to_string())
    }
}
