use std::fmt;

/// General-purpose error type used throughout the crate, following the same
/// `Box<dyn Error>` idiom as the rest of this codebase: most failures are
/// reported once (to the log, or to the parent over the handshake pipe) and
/// never inspected programmatically, so a trait object is simpler than a
/// bespoke enum per fallible operation.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// User-facing configuration/startup failures.
///
/// Unlike the generic [`Error`] alias, these are raised before any child is
/// ever forked, are always printed to the user (not just logged), and always
/// terminate the process with a non-zero exit code.
#[derive(Debug)]
pub enum JailError {
    UnknownMode(String),
    InvalidPort(u32),
    UnknownUser(String),
    UnknownGroup(String),
    MissingCommand,
    InvalidRlimit { resource: &'static str, value: String },
}

impl fmt::Display for JailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JailError::UnknownMode(m) => write!(f, "unknown mode '{m}', expected one of l/o/r"),
            JailError::InvalidPort(p) => {
                write!(f, "TCP port {p} out of bounds (1 <= port <= 65535)")
            }
            JailError::UnknownUser(u) => write!(f, "no such user '{u}'"),
            JailError::UnknownGroup(g) => write!(f, "no such group '{g}'"),
            JailError::MissingCommand => write!(f, "no command provided"),
            JailError::InvalidRlimit { resource, value } => {
                write!(f, "RLIMIT_{resource} needs 'max', 'def' or a numeric value, got '{value}'")
            }
        }
    }
}

impl std::error::Error for JailError {}

/// Terminates the calling process immediately, never returning - the
/// in-child `ChildSteps` contract (spec.md §4.F) requires every setup
/// failure to `_exit(1)` rather than unwind or return, so the parent's
/// reaper is the single point of cleanup.
pub fn exit_child<T>(result: Result<T, Error>) -> ! {
    match result {
        Ok(_) => unsafe { nix::libc::_exit(0) },
        Err(_) => unsafe { nix::libc::_exit(1) },
    }
}
