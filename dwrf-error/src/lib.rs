//! Error handling for the dwrf crates.
//!
//! [`DwrfError`] is the single error type used across the workspace. The
//! [`dwrf_err!`] and [`dwrf_bail!`] macros construct and return errors with
//! formatted messages; [`DwrfExpect`] and [`DwrfUnwrap`] convert options and
//! results into panics carrying a descriptive message, for use in tests and
//! in code paths whose failure indicates a programming bug.

use std::fmt::{Display, Formatter};
use std::{env, fmt, io};

/// A string that is cheap to clone and share between error values.
pub type ErrString = std::borrow::Cow<'static, str>;

/// The workspace-wide error type.
#[derive(Debug)]
pub enum DwrfError {
    /// A caller violated an API contract, e.g. a page with the wrong number
    /// of columns. Indicates a bug in the calling code.
    InvalidArgument(ErrString),
    /// The writer reached a state its invariants forbid. Indicates a bug in
    /// this crate, not in the caller.
    InvalidState(ErrString),
    /// The encryption configuration does not cover the nodes it must cover.
    InvalidEncryption(ErrString),
    /// A produced file failed the post-write validation read-back.
    CorruptFile(ErrString),
    /// An operation is not supported by this build or configuration.
    NotImplemented(ErrString),
    /// An underlying I/O failure. The file being written is unusable.
    IoError(io::Error),
    /// A context frame wrapped around another error.
    Context(ErrString, Box<DwrfError>),
}

impl DwrfError {
    /// Wrap this error with an additional message describing what was being
    /// attempted when it occurred.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        DwrfError::Context(msg.into(), Box::new(self))
    }
}

impl Display for DwrfError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::InvalidEncryption(msg) => write!(f, "invalid encryption: {msg}"),
            Self::CorruptFile(msg) => write!(f, "corrupt file: {msg}"),
            Self::NotImplemented(msg) => write!(f, "not implemented: {msg}"),
            Self::IoError(e) => write!(f, "io error: {e}"),
            Self::Context(msg, inner) => write!(f, "{msg}: {inner}"),
        }
    }
}

impl std::error::Error for DwrfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoError(e) => Some(e),
            Self::Context(_, inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for DwrfError {
    fn from(e: io::Error) -> Self {
        DwrfError::IoError(e)
    }
}

/// The workspace-wide result type.
pub type DwrfResult<T> = Result<T, DwrfError>;

/// Construct a [`DwrfError`] with a formatted message.
///
/// The first argument may be an error-kind selector, e.g.
/// `dwrf_err!(CorruptFile: "bad magic {:?}", magic)`. Without a selector the
/// error is an `InvalidState`.
#[macro_export]
macro_rules! dwrf_err {
    (InvalidArgument: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::DwrfError::InvalidArgument(format!($fmt $(, $arg)*).into())
    };
    (InvalidEncryption: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::DwrfError::InvalidEncryption(format!($fmt $(, $arg)*).into())
    };
    (CorruptFile: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::DwrfError::CorruptFile(format!($fmt $(, $arg)*).into())
    };
    (NotImplemented: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::DwrfError::NotImplemented(format!($fmt $(, $arg)*).into())
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::DwrfError::InvalidState(format!($fmt $(, $arg)*).into())
    };
}

/// Return early with a [`DwrfError`], as [`dwrf_err!`] but wrapped in `Err`.
#[macro_export]
macro_rules! dwrf_bail {
    ($($tt:tt)+) => {
        return Err($crate::dwrf_err!($($tt)+))
    };
}

/// Panic with a [`DwrfError`] carrying a formatted message. Reserved for
/// unrecoverable programming errors.
#[macro_export]
macro_rules! dwrf_panic {
    ($($tt:tt)+) => {{
        let err = $crate::dwrf_err!($($tt)+);
        panic!("{}", err)
    }};
}

const PANIC_ON_ERR: &str = "DWRF_PANIC_ON_ERR";

fn maybe_backtrace_panic(err: &DwrfError, msg: &str) -> ! {
    // Opt-in via env var to abort with the full chain, useful when a test
    // harness swallows error sources.
    if env::var(PANIC_ON_ERR).is_ok() {
        panic!("{msg}: {err:?}")
    }
    panic!("{msg}: {err}")
}

/// Unwrap an option or result, panicking with a static message on failure.
pub trait DwrfExpect {
    type Output;

    fn dwrf_expect(self, msg: &str) -> Self::Output;
}

impl<T> DwrfExpect for Option<T> {
    type Output = T;

    fn dwrf_expect(self, msg: &str) -> T {
        match self {
            Some(v) => v,
            None => panic!("expected Some: {msg}"),
        }
    }
}

impl<T> DwrfExpect for DwrfResult<T> {
    type Output = T;

    fn dwrf_expect(self, msg: &str) -> T {
        match self {
            Ok(v) => v,
            Err(e) => maybe_backtrace_panic(&e, msg),
        }
    }
}

/// Unwrap a result, panicking with the error's display message on failure.
pub trait DwrfUnwrap {
    type Output;

    fn dwrf_unwrap(self) -> Self::Output;
}

impl<T> DwrfUnwrap for DwrfResult<T> {
    type Output = T;

    fn dwrf_unwrap(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => maybe_backtrace_panic(&e, "unwrapped an error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails() -> DwrfResult<()> {
        dwrf_bail!(CorruptFile: "stripe {} is truncated", 3)
    }

    #[test]
    fn error_kinds_format() {
        let err = fails().unwrap_err();
        assert_eq!(err.to_string(), "corrupt file: stripe 3 is truncated");

        let err = err.with_context("validating file");
        assert_eq!(
            err.to_string(),
            "validating file: corrupt file: stripe 3 is truncated"
        );
    }

    #[test]
    fn io_error_converts() {
        let io = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err: DwrfError = io.into();
        assert!(matches!(err, DwrfError::IoError(_)));
    }

    #[test]
    #[should_panic(expected = "expected Some: missing node")]
    fn expect_panics_with_message() {
        let opt: Option<u32> = None;
        opt.dwrf_expect("missing node");
    }
}
