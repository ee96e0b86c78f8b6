use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

use crate::pal::{Bindings, BindingsFacade, OwnedHandle};
use crate::{Error, ProcessId, Result};

/// The executable names of the processes to bind, e.g. `SGuard64.exe`.
///
/// Names are compared case-sensitively against the short executable name reported by the
/// operating system. Directories are not part of the name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AllowList {
    names: BTreeSet<String>,
}

impl AllowList {
    /// Creates an allow-list from a set of executable names. Duplicates are merged.
    #[must_use]
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `exe_name` is one of the target names.
    #[must_use]
    pub fn contains(&self, exe_name: &str) -> bool {
        self.names.contains(exe_name)
    }

    /// Whether the allow-list names no process at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of distinct target names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// The target names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, name) in self.iter().enumerate() {
            if position > 0 {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
        }

        Ok(())
    }
}

/// A running process whose executable name is on the allow-list.
///
/// Only meaningful for the pass that found it, as the operating system reuses process IDs.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct TargetProcess {
    /// Process ID at the time the snapshot was taken.
    pub pid: ProcessId,

    /// The matched executable name.
    pub name: String,
}

/// Finds running processes by executable name.
#[derive(Clone, Debug)]
pub struct ProcessFinder {
    bindings: BindingsFacade,
}

impl ProcessFinder {
    /// Creates a finder that enumerates the processes of the running system.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bindings(BindingsFacade::target())
    }

    pub(crate) fn with_bindings(bindings: BindingsFacade) -> Self {
        Self { bindings }
    }

    /// Returns every running process whose executable name is on `allow_list`, in snapshot order.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyAllowList`] if `allow_list` names nothing, in which case no snapshot is
    /// taken. [`Error::ProcessEnumerationFailed`] if the process snapshot cannot be taken or read.
    pub fn find_processes(&self, allow_list: &AllowList) -> Result<Vec<TargetProcess>> {
        if allow_list.is_empty() {
            return Err(Error::EmptyAllowList);
        }

        let snapshot = self
            .bindings
            .create_process_snapshot()
            .map_err(Error::ProcessEnumerationFailed)?;
        let snapshot = OwnedHandle::new(&self.bindings, snapshot);

        let mut matches = Vec::new();
        let mut scanned: usize = 0;

        let mut entry = self
            .bindings
            .process_first(snapshot.raw())
            .map_err(Error::ProcessEnumerationFailed)?;

        loop {
            scanned = scanned.saturating_add(1);

            if allow_list.contains(&entry.exe_name) {
                matches.push(TargetProcess {
                    pid: entry.pid,
                    name: entry.exe_name,
                });
            }

            entry = match self.bindings.process_next(snapshot.raw()) {
                Ok(next) => next,
                Err(e) if e.is_no_more_files() => break,
                Err(e) => return Err(Error::ProcessEnumerationFailed(e)),
            };
        }

        debug!(scanned, matched = matches.len(), "enumerated processes");

        Ok(matches)
    }

    /// Returns the process IDs of [`find_processes()`][Self::find_processes].
    ///
    /// # Errors
    ///
    /// See [`find_processes()`][Self::find_processes].
    pub fn find_pids(&self, allow_list: &AllowList) -> Result<Vec<ProcessId>> {
        Ok(self
            .find_processes(allow_list)?
            .into_iter()
            .map(|process| process.pid)
            .collect())
    }
}

impl Default for ProcessFinder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configures `bindings` to present a snapshot with the given `(pid, name)` entries.
///
/// The snapshot handle is expected to be closed exactly once.
#[cfg(test)]
pub(crate) fn simulate_processes(
    bindings: &mut crate::pal::MockBindings,
    processes: &[(ProcessId, &str)],
) {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use mockall::predicate::eq;

    use crate::OsError;
    use crate::pal::{ProcessEntry, RawHandle};

    const SNAPSHOT: RawHandle = RawHandle(0x5A);

    let mut entries: VecDeque<ProcessEntry> = processes
        .iter()
        .map(|(pid, name)| ProcessEntry {
            pid: *pid,
            exe_name: (*name).to_string(),
        })
        .collect();

    bindings
        .expect_create_process_snapshot()
        .times(1)
        .returning(|| Ok(SNAPSHOT));

    let first = entries.pop_front();
    bindings
        .expect_process_first()
        .with(eq(SNAPSHOT))
        .times(1)
        .return_once(move |_| first.ok_or(OsError::new(OsError::ERROR_NO_MORE_FILES)));

    let remaining = Mutex::new(entries);
    bindings
        .expect_process_next()
        .with(eq(SNAPSHOT))
        .returning(move |_| {
            remaining
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(OsError::new(OsError::ERROR_NO_MORE_FILES))
        });

    bindings
        .expect_close_handle()
        .with(eq(SNAPSHOT))
        .times(1)
        .returning(|_| Ok(()));
}
