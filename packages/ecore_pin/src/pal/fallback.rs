use std::thread;

use crate::pal::{Bindings, ProcessEntry, RawHandle};
use crate::{OsError, ProcessId};

/// Bindings for platforms without the Windows processor topology and process scheduling APIs.
///
/// Every operation reports `ERROR_NOT_SUPPORTED`, which sends topology discovery down the
/// fallback path and makes every pass end with an enumeration failure.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

fn not_supported() -> OsError {
    OsError::new(OsError::ERROR_NOT_SUPPORTED)
        .with_message("processor binding is only supported on Windows")
}

impl Bindings for BuildTargetBindings {
    fn get_logical_processor_information_ex(
        &self,
        _relationship: u32,
        _buffer: &mut [u8],
        _returned_length: &mut u32,
    ) -> Result<(), OsError> {
        Err(not_supported())
    }

    fn get_active_processor_count(&self) -> u32 {
        thread::available_parallelism()
            .ok()
            .and_then(|count| u32::try_from(count.get()).ok())
            .unwrap_or(1)
    }

    fn create_process_snapshot(&self) -> Result<RawHandle, OsError> {
        Err(not_supported())
    }

    fn process_first(&self, _snapshot: RawHandle) -> Result<ProcessEntry, OsError> {
        Err(not_supported())
    }

    fn process_next(&self, _snapshot: RawHandle) -> Result<ProcessEntry, OsError> {
        Err(not_supported())
    }

    fn open_process(&self, _desired_access: u32, _pid: ProcessId) -> Result<RawHandle, OsError> {
        Err(not_supported())
    }

    fn set_process_affinity_mask(&self, _process: RawHandle, _mask: usize) -> Result<(), OsError> {
        Err(not_supported())
    }

    fn set_priority_class(&self, _process: RawHandle, _priority_class: u32) -> Result<(), OsError> {
        Err(not_supported())
    }

    fn close_handle(&self, _handle: RawHandle) -> Result<(), OsError> {
        Ok(())
    }
}
