use std::fmt;

use thiserror::Error;

use crate::{CoreIndex, ProcessId};

/// Errors that can occur while discovering processors, finding processes or binding them.
///
/// None of these are fatal to the background worker. Topology errors are turned into the
/// fallback core selection, enumeration errors abort only the current pass and binding errors
/// only affect the process they were raised for.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The operating system refused to describe the processor topology.
    #[error("processor topology query failed: {0}")]
    TopologyQueryFailed(OsError),

    /// The processor topology was readable but did not mark any processor as an efficiency
    /// processor.
    #[error("no efficiency processors found in the processor topology")]
    NoEfficientCoresFound,

    /// The caller asked us to search for processes but did not name any.
    #[error("the list of target process names is empty")]
    EmptyAllowList,

    /// The operating system refused to enumerate running processes.
    #[error("process enumeration failed: {0}")]
    ProcessEnumerationFailed(OsError),

    /// The target process could not be opened with the access rights we need.
    #[error("failed to open process {pid}: {source}")]
    ProcessOpenFailed {
        /// The process we attempted to open.
        pid: ProcessId,

        /// Why the operating system refused.
        source: OsError,
    },

    /// The target process could not be restricted to the target processor.
    #[error("failed to restrict process {pid} to processor {core}: {source}")]
    AffinitySetFailed {
        /// The process whose affinity we attempted to change.
        pid: ProcessId,

        /// The processor we attempted to restrict the process to.
        core: CoreIndex,

        /// Why the operating system refused.
        source: OsError,
    },

    /// The scheduling priority of the target process could not be lowered.
    ///
    /// The affinity of the process has already been changed when this is returned.
    #[error("failed to lower the priority of process {pid}: {source}")]
    PriorityWriteFailed {
        /// The process whose priority we attempted to change.
        pid: ProcessId,

        /// Why the operating system refused.
        source: OsError,
    },
}

impl Error {
    /// The operating system error behind this error, if there is one.
    #[must_use]
    pub fn os_error(&self) -> Option<&OsError> {
        match self {
            Self::TopologyQueryFailed(source)
            | Self::ProcessEnumerationFailed(source)
            | Self::ProcessOpenFailed { source, .. }
            | Self::AffinitySetFailed { source, .. }
            | Self::PriorityWriteFailed { source, .. } => Some(source),
            Self::NoEfficientCoresFound | Self::EmptyAllowList => None,
        }
    }
}

/// A specialized `Result` type returning the crate's [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

/// An error reported by the operating system, identified by its Win32 error code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OsError {
    code: u32,
    message: Option<String>,
}

impl OsError {
    /// The data area passed to a system call is too small.
    pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;

    /// There are no more entries to enumerate.
    pub const ERROR_NO_MORE_FILES: u32 = 18;

    /// Access is denied.
    pub const ERROR_ACCESS_DENIED: u32 = 5;

    /// The parameter is incorrect.
    pub const ERROR_INVALID_PARAMETER: u32 = 87;

    /// The request is not supported.
    pub const ERROR_NOT_SUPPORTED: u32 = 50;

    /// Creates an error from a bare Win32 error code.
    #[must_use]
    pub const fn new(code: u32) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Attaches the human-readable description supplied by the operating system.
    ///
    /// Empty messages are ignored.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = message.trim();

        if !message.is_empty() {
            self.message = Some(message.to_string());
        }

        self
    }

    /// The Win32 error code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        self.code
    }

    /// The description supplied by the operating system, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether the operating system refused the operation because we lack the privileges for it.
    #[must_use]
    pub const fn is_access_denied(&self) -> bool {
        self.code == Self::ERROR_ACCESS_DENIED
    }

    pub(crate) const fn is_insufficient_buffer(&self) -> bool {
        self.code == Self::ERROR_INSUFFICIENT_BUFFER
    }

    pub(crate) const fn is_no_more_files(&self) -> bool {
        self.code == Self::ERROR_NO_MORE_FILES
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message} (OS error {})", self.code),
            None => write!(f, "OS error {}", self.code),
        }
    }
}

impl std::error::Error for OsError {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug, Clone);
    assert_impl_all!(OsError: Send, Sync, Debug, Clone);

    #[test]
    fn os_error_display_with_and_without_message() {
        assert_eq!(OsError::new(5).to_string(), "OS error 5");
        assert_eq!(
            OsError::new(5)
                .with_message("Access is denied.\r\n")
                .to_string(),
            "Access is denied. (OS error 5)"
        );
    }

    #[test]
    fn blank_message_is_ignored() {
        let error = OsError::new(87).with_message("   ");
        assert_eq!(error.message(), None);
    }

    #[test]
    fn bind_errors_name_the_failed_step() {
        let open = Error::ProcessOpenFailed {
            pid: 42,
            source: OsError::new(OsError::ERROR_ACCESS_DENIED),
        };
        let affinity = Error::AffinitySetFailed {
            pid: 42,
            core: 7,
            source: OsError::new(OsError::ERROR_INVALID_PARAMETER),
        };
        let priority = Error::PriorityWriteFailed {
            pid: 42,
            source: OsError::new(OsError::ERROR_ACCESS_DENIED),
        };

        assert_eq!(open.to_string(), "failed to open process 42: OS error 5");
        assert_eq!(
            affinity.to_string(),
            "failed to restrict process 42 to processor 7: OS error 87"
        );
        assert_eq!(
            priority.to_string(),
            "failed to lower the priority of process 42: OS error 5"
        );

        assert!(open.os_error().unwrap().is_access_denied());
        assert!(!affinity.os_error().unwrap().is_access_denied());
    }

    #[test]
    fn conditions_without_os_error() {
        assert_eq!(Error::NoEfficientCoresFound.os_error(), None);
        assert_eq!(Error::EmptyAllowList.os_error(), None);
    }
}
