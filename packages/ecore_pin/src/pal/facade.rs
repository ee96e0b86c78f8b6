use std::fmt::Debug;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::pal::MockBindings;
use crate::pal::{Bindings, BuildTargetBindings, ProcessEntry, RawHandle};
use crate::{OsError, ProcessId};

/// Static instance of the real bindings for production use.
static BUILD_TARGET_BINDINGS: BuildTargetBindings = BuildTargetBindings;

/// Hide the real/mock bindings choice behind a single type.
#[derive(Clone)]
pub(crate) enum BindingsFacade {
    Target(&'static BuildTargetBindings),

    #[cfg(test)]
    Mock(Arc<MockBindings>),
}

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl BindingsFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BUILD_TARGET_BINDINGS)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockBindings) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl Bindings for BindingsFacade {
    fn get_logical_processor_information_ex(
        &self,
        relationship: u32,
        buffer: &mut [u8],
        returned_length: &mut u32,
    ) -> Result<(), OsError> {
        match self {
            Self::Target(bindings) => {
                bindings.get_logical_processor_information_ex(relationship, buffer, returned_length)
            }
            #[cfg(test)]
            Self::Mock(bindings) => {
                bindings.get_logical_processor_information_ex(relationship, buffer, returned_length)
            }
        }
    }

    fn get_active_processor_count(&self) -> u32 {
        match self {
            Self::Target(bindings) => bindings.get_active_processor_count(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.get_active_processor_count(),
        }
    }

    fn create_process_snapshot(&self) -> Result<RawHandle, OsError> {
        match self {
            Self::Target(bindings) => bindings.create_process_snapshot(),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.create_process_snapshot(),
        }
    }

    fn process_first(&self, snapshot: RawHandle) -> Result<ProcessEntry, OsError> {
        match self {
            Self::Target(bindings) => bindings.process_first(snapshot),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.process_first(snapshot),
        }
    }

    fn process_next(&self, snapshot: RawHandle) -> Result<ProcessEntry, OsError> {
        match self {
            Self::Target(bindings) => bindings.process_next(snapshot),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.process_next(snapshot),
        }
    }

    fn open_process(&self, desired_access: u32, pid: ProcessId) -> Result<RawHandle, OsError> {
        match self {
            Self::Target(bindings) => bindings.open_process(desired_access, pid),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.open_process(desired_access, pid),
        }
    }

    fn set_process_affinity_mask(&self, process: RawHandle, mask: usize) -> Result<(), OsError> {
        match self {
            Self::Target(bindings) => bindings.set_process_affinity_mask(process, mask),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.set_process_affinity_mask(process, mask),
        }
    }

    fn set_priority_class(&self, process: RawHandle, priority_class: u32) -> Result<(), OsError> {
        match self {
            Self::Target(bindings) => bindings.set_priority_class(process, priority_class),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.set_priority_class(process, priority_class),
        }
    }

    fn close_handle(&self, handle: RawHandle) -> Result<(), OsError> {
        match self {
            Self::Target(bindings) => bindings.close_handle(handle),
            #[cfg(test)]
            Self::Mock(bindings) => bindings.close_handle(handle),
        }
    }
}

#[cfg(test)]
impl From<MockBindings> for BindingsFacade {
    fn from(bindings: MockBindings) -> Self {
        Self::from_mock(bindings)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
impl Debug for BindingsFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
