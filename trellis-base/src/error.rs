// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A stable kind taxonomy callers can match on without parsing messages, plus
//    room for the aggregated diagnostics a failed commit validation reports

use std::borrow::Cow;
use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

// The kinds callers are expected to branch on. Everything that doesn't
// need programmatic recovery lands in Other.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    // Transaction lifecycle. Cross-thread use of a transaction is reported
    // as TransactionClosed, indistinguishable from use-after-close.
    TransactionClosed,
    ReadOnly,
    ReadOnlyCommit,
    ConcurrentTransactionOnThread,
    SessionClosed,
    ValidationFailed,
    // ID allocation. PoolBackend is the one retryable kind.
    PoolExhausted,
    PoolTimeout,
    PoolBackend,
    PoolClosed,
    Interrupted,
    // Store or authority I/O outside the pool.
    Backend,
    Other,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    diagnostics: Vec<String>,
    inner: DynBacktraceError,
}

pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(ErrorKind::Other, err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, err: E) -> Error {
        error!(target: "trellis", "{:?}: {:?}", kind, err);
        let dbe = DynBacktraceError::from(err);
        Error {
            kind,
            diagnostics: Vec::new(),
            inner: dbe,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // Nonempty only for ValidationFailed; a failed commit reports all
    // detected problems, not the first.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn validation(diagnostics: Vec<String>) -> Error {
        let mut e = err_kind(
            ErrorKind::ValidationFailed,
            format!(
                "commit validation failed with {} problem(s)",
                diagnostics.len()
            ),
        );
        e.diagnostics = diagnostics;
        e
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::PoolBackend | ErrorKind::Backend)
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    err_kind(ErrorKind::Other, msg)
}

pub fn err_kind(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(kind, SimpleErr(msg.into()))
}

#[test]
fn test_error() {
    let e = err("test error");
    assert_eq!(e.kind(), ErrorKind::Other);
    let e = err_kind(ErrorKind::PoolTimeout, "block fetch timed out");
    assert_eq!(e.kind(), ErrorKind::PoolTimeout);
    assert!(!e.is_retryable());
}

#[test]
fn test_validation_error_keeps_all_diagnostics() {
    let e = Error::validation(vec![
        "role 'friend' has no relation type relating it".to_string(),
        "relation type 'friendship' relates no roles".to_string(),
    ]);
    assert_eq!(e.kind(), ErrorKind::ValidationFailed);
    assert_eq!(e.diagnostics().len(), 2);
}
