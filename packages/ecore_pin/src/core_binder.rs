use tracing::debug;

use crate::pal::{
    Bindings, BindingsFacade, IDLE_PRIORITY_CLASS, OwnedHandle, PROCESS_QUERY_INFORMATION,
    PROCESS_SET_INFORMATION,
};
use crate::{CoreIndex, Error, OsError, ProcessId, Result};

/// Restricts processes to a single logical processor and drops them to idle priority.
#[derive(Clone, Debug)]
pub struct CoreBinder {
    bindings: BindingsFacade,
}

impl CoreBinder {
    /// Creates a binder that acts on the processes of the running system.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bindings(BindingsFacade::target())
    }

    pub(crate) fn with_bindings(bindings: BindingsFacade) -> Self {
        Self { bindings }
    }

    /// Allows process `pid` to run only on processor `core` and sets its priority class to idle.
    ///
    /// The process is opened with the access rights to change and query scheduling attributes,
    /// nothing more. Binding an already bound process again changes nothing.
    ///
    /// Changes are not rolled back: if lowering the priority fails, the process keeps its new
    /// affinity.
    ///
    /// # Errors
    ///
    /// One error per step, naming the step that failed:
    /// [`Error::ProcessOpenFailed`], [`Error::AffinitySetFailed`] (also returned for a `core`
    /// that does not fit in a single-group affinity mask) or [`Error::PriorityWriteFailed`].
    pub fn bind(&self, pid: ProcessId, core: CoreIndex) -> Result<()> {
        let process = self
            .bindings
            .open_process(PROCESS_SET_INFORMATION | PROCESS_QUERY_INFORMATION, pid)
            .map_err(|source| Error::ProcessOpenFailed { pid, source })?;
        let process = OwnedHandle::new(&self.bindings, process);

        let mask = affinity_mask(core).ok_or_else(|| Error::AffinitySetFailed {
            pid,
            core,
            source: OsError::new(OsError::ERROR_INVALID_PARAMETER)
                .with_message("processor index does not fit in an affinity mask"),
        })?;

        self.bindings
            .set_process_affinity_mask(process.raw(), mask)
            .map_err(|source| Error::AffinitySetFailed { pid, core, source })?;

        self.bindings
            .set_priority_class(process.raw(), IDLE_PRIORITY_CLASS)
            .map_err(|source| Error::PriorityWriteFailed { pid, source })?;

        debug!(pid, core, mask, "process bound");

        Ok(())
    }
}

impl Default for CoreBinder {
    fn default() -> Self {
        Self::new()
    }
}

/// Affinity mask that selects only processor `core`, if it fits in one mask.
fn affinity_mask(core: CoreIndex) -> Option<usize> {
    1_usize.checked_shl(core)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::{Arc, Mutex};

    use mockall::Sequence;
    use mockall::predicate::eq;

    use super::*;
    use crate::pal::{MockBindings, RawHandle};

    const PROCESS: RawHandle = RawHandle(0x44);

    fn binder(bindings: MockBindings) -> CoreBinder {
        CoreBinder::with_bindings(bindings.into())
    }

    fn expect_open(bindings: &mut MockBindings, pid: ProcessId) {
        bindings
            .expect_open_process()
            .with(
                eq(PROCESS_SET_INFORMATION | PROCESS_QUERY_INFORMATION),
                eq(pid),
            )
            .times(1)
            .returning(|_, _| Ok(PROCESS));
    }

    fn expect_close(bindings: &mut MockBindings) {
        bindings
            .expect_close_handle()
            .with(eq(PROCESS))
            .times(1)
            .returning(|_| Ok(()));
    }

    #[test]
    fn opens_then_sets_affinity_then_priority() {
        let mut bindings = MockBindings::new();
        let mut seq = Sequence::new();

        bindings
            .expect_open_process()
            .with(
                eq(PROCESS_SET_INFORMATION | PROCESS_QUERY_INFORMATION),
                eq(1234),
            )
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(PROCESS));
        bindings
            .expect_set_process_affinity_mask()
            .with(eq(PROCESS), eq(0b1_0000_usize))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        bindings
            .expect_set_priority_class()
            .with(eq(PROCESS), eq(IDLE_PRIORITY_CLASS))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        bindings
            .expect_close_handle()
            .with(eq(PROCESS))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        binder(bindings).bind(1234, 4).unwrap();
    }

    #[test]
    fn open_failure_is_reported_without_close() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_open_process()
            .times(1)
            .returning(|_, _| Err(OsError::new(OsError::ERROR_ACCESS_DENIED)));

        let error = binder(bindings).bind(7, 2).unwrap_err();

        assert_eq!(
            error,
            Error::ProcessOpenFailed {
                pid: 7,
                source: OsError::new(OsError::ERROR_ACCESS_DENIED)
            }
        );
        assert!(error.os_error().unwrap().is_access_denied());
    }

    #[test]
    fn affinity_failure_skips_priority_and_closes() {
        let mut bindings = MockBindings::new();
        expect_open(&mut bindings, 7);
        bindings
            .expect_set_process_affinity_mask()
            .times(1)
            .returning(|_, _| Err(OsError::new(OsError::ERROR_ACCESS_DENIED)));
        bindings.expect_set_priority_class().never();
        expect_close(&mut bindings);

        assert_eq!(
            binder(bindings).bind(7, 2),
            Err(Error::AffinitySetFailed {
                pid: 7,
                core: 2,
                source: OsError::new(OsError::ERROR_ACCESS_DENIED)
            })
        );
    }

    #[test]
    fn priority_failure_keeps_affinity_and_closes() {
        let mut bindings = MockBindings::new();
        expect_open(&mut bindings, 7);
        bindings
            .expect_set_process_affinity_mask()
            .with(eq(PROCESS), eq(0b100_usize))
            .times(1)
            .returning(|_, _| Ok(()));
        bindings
            .expect_set_priority_class()
            .times(1)
            .returning(|_, _| Err(OsError::new(OsError::ERROR_ACCESS_DENIED)));
        expect_close(&mut bindings);

        assert_eq!(
            binder(bindings).bind(7, 2),
            Err(Error::PriorityWriteFailed {
                pid: 7,
                source: OsError::new(OsError::ERROR_ACCESS_DENIED)
            })
        );
    }

    #[test]
    fn core_outside_mask_is_rejected_and_closes() {
        let mut bindings = MockBindings::new();
        expect_open(&mut bindings, 7);
        bindings.expect_set_process_affinity_mask().never();
        bindings.expect_set_priority_class().never();
        expect_close(&mut bindings);

        let core: CoreIndex = usize::BITS;
        let error = binder(bindings).bind(7, core).unwrap_err();

        assert!(matches!(
            error,
            Error::AffinitySetFailed { pid: 7, core: c, ref source }
                if c == core && source.code() == OsError::ERROR_INVALID_PARAMETER
        ));
    }

    #[test]
    fn highest_core_in_mask_is_accepted() {
        let mut bindings = MockBindings::new();
        expect_open(&mut bindings, 7);
        bindings
            .expect_set_process_affinity_mask()
            .with(eq(PROCESS), eq(1_usize << (usize::BITS - 1)))
            .times(1)
            .returning(|_, _| Ok(()));
        bindings
            .expect_set_priority_class()
            .times(1)
            .returning(|_, _| Ok(()));
        expect_close(&mut bindings);

        binder(bindings).bind(7, usize::BITS - 1).unwrap();
    }

    #[test]
    fn binding_twice_leaves_same_state() {
        // Simulated process state, overwritten by each call like the real attributes are.
        let state: Arc<Mutex<(usize, u32)>> = Arc::new(Mutex::new((usize::MAX, 0x0020)));

        let mut bindings = MockBindings::new();
        bindings
            .expect_open_process()
            .times(2)
            .returning(|_, _| Ok(PROCESS));
        bindings.expect_set_process_affinity_mask().times(2).returning({
            let state = Arc::clone(&state);
            move |_, mask| {
                state.lock().unwrap().0 = mask;
                Ok(())
            }
        });
        bindings.expect_set_priority_class().times(2).returning({
            let state = Arc::clone(&state);
            move |_, class| {
                state.lock().unwrap().1 = class;
                Ok(())
            }
        });
        bindings
            .expect_close_handle()
            .times(2)
            .returning(|_| Ok(()));

        let binder = binder(bindings);

        binder.bind(5, 3).unwrap();
        let after_once = *state.lock().unwrap();

        binder.bind(5, 3).unwrap();
        let after_twice = *state.lock().unwrap();

        assert_eq!(after_once, (0b1000, IDLE_PRIORITY_CLASS));
        assert_eq!(after_once, after_twice);
    }
}
