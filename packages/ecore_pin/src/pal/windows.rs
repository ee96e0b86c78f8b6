#![cfg_attr(coverage_nightly, coverage(off))]

use std::ffi::c_void;
use std::{ptr, slice};

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::SystemInformation::{
    GetLogicalProcessorInformationEx, LOGICAL_PROCESSOR_RELATIONSHIP,
};
use windows::Win32::System::Threading::{
    GetActiveProcessorCount, OpenProcess, PROCESS_ACCESS_RIGHTS, PROCESS_CREATION_FLAGS,
    SetPriorityClass, SetProcessAffinityMask,
};

use crate::pal::{Bindings, ProcessEntry, RawHandle};
use crate::{OsError, ProcessId};

/// Makes `GetActiveProcessorCount()` count the processors of every processor group.
const ALL_PROCESSOR_GROUPS: u16 = 0xFFFF;

/// HRESULT facility prefix that marks a wrapped Win32 error code.
const FACILITY_WIN32_PREFIX: u32 = 0x8007_0000;

/// FFI bindings that target the real operating system that the build is targeting.
///
/// You would only use different bindings in unit tests that need to use mock bindings.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

impl Bindings for BuildTargetBindings {
    fn get_logical_processor_information_ex(
        &self,
        relationship: u32,
        buffer: &mut [u8],
        returned_length: &mut u32,
    ) -> Result<(), OsError> {
        let Ok(relationship) = i32::try_from(relationship) else {
            return Err(OsError::new(OsError::ERROR_INVALID_PARAMETER));
        };
        let relationship = LOGICAL_PROCESSOR_RELATIONSHIP(relationship);

        if buffer.is_empty() {
            // SAFETY: Pointers must outlive the call (true - the length is borrowed from caller).
            return unsafe {
                GetLogicalProcessorInformationEx(relationship, None, &raw mut *returned_length)
            }
            .map_err(|e| os_error(&e));
        }

        // The records contain pointer-sized fields, so the operating system gets pointer-aligned
        // memory to write into and we copy the bytes out afterwards.
        let mut aligned = vec![0_usize; buffer.len().div_ceil(size_of::<usize>())];
        let Ok(mut length) = u32::try_from(buffer.len()) else {
            return Err(OsError::new(OsError::ERROR_INVALID_PARAMETER));
        };

        // SAFETY: Pointers must outlive the call (true - local variables live beyond call) and
        // the buffer is at least `length` bytes long.
        let result = unsafe {
            GetLogicalProcessorInformationEx(
                relationship,
                Some(aligned.as_mut_ptr().cast()),
                &raw mut length,
            )
        };

        *returned_length = length;
        result.map_err(|e| os_error(&e))?;

        // SAFETY: The allocation is at least `buffer.len()` bytes and `u8` has no alignment or
        // validity requirements.
        let written = unsafe { slice::from_raw_parts(aligned.as_ptr().cast::<u8>(), buffer.len()) };
        buffer.copy_from_slice(written);

        Ok(())
    }

    fn get_active_processor_count(&self) -> u32 {
        // SAFETY: No safety requirements.
        unsafe { GetActiveProcessorCount(ALL_PROCESSOR_GROUPS) }
    }

    fn create_process_snapshot(&self) -> Result<RawHandle, OsError> {
        // SAFETY: No safety requirements. The caller takes ownership of the handle.
        unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
            .map(RawHandle::from)
            .map_err(|e| os_error(&e))
    }

    fn process_first(&self, snapshot: RawHandle) -> Result<ProcessEntry, OsError> {
        let mut entry = empty_process_entry();

        // SAFETY: Pointers must outlive the call (true - local variable lives beyond call).
        unsafe { Process32FirstW(snapshot.into(), &raw mut entry) }.map_err(|e| os_error(&e))?;

        Ok(decode_process_entry(&entry))
    }

    fn process_next(&self, snapshot: RawHandle) -> Result<ProcessEntry, OsError> {
        let mut entry = empty_process_entry();

        // SAFETY: Pointers must outlive the call (true - local variable lives beyond call).
        unsafe { Process32NextW(snapshot.into(), &raw mut entry) }.map_err(|e| os_error(&e))?;

        Ok(decode_process_entry(&entry))
    }

    fn open_process(&self, desired_access: u32, pid: ProcessId) -> Result<RawHandle, OsError> {
        // SAFETY: No safety requirements. The caller takes ownership of the handle.
        unsafe { OpenProcess(PROCESS_ACCESS_RIGHTS(desired_access), false, pid) }
            .map(RawHandle::from)
            .map_err(|e| os_error(&e))
    }

    fn set_process_affinity_mask(&self, process: RawHandle, mask: usize) -> Result<(), OsError> {
        // SAFETY: No safety requirements beyond passing a valid handle.
        unsafe { SetProcessAffinityMask(process.into(), mask) }.map_err(|e| os_error(&e))
    }

    fn set_priority_class(&self, process: RawHandle, priority_class: u32) -> Result<(), OsError> {
        // SAFETY: No safety requirements beyond passing a valid handle.
        unsafe { SetPriorityClass(process.into(), PROCESS_CREATION_FLAGS(priority_class)) }
            .map_err(|e| os_error(&e))
    }

    fn close_handle(&self, handle: RawHandle) -> Result<(), OsError> {
        // SAFETY: The caller guarantees the handle is owned and not used after this call.
        unsafe { CloseHandle(handle.into()) }.map_err(|e| os_error(&e))
    }
}

impl From<HANDLE> for RawHandle {
    fn from(handle: HANDLE) -> Self {
        Self(handle.0.expose_provenance())
    }
}

impl From<RawHandle> for HANDLE {
    fn from(handle: RawHandle) -> Self {
        Self(ptr::with_exposed_provenance_mut::<c_void>(handle.0))
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "the structure is a few hundred bytes"
)]
const PROCESS_ENTRY_SIZE: u32 = size_of::<PROCESSENTRY32W>() as u32;

fn empty_process_entry() -> PROCESSENTRY32W {
    PROCESSENTRY32W {
        dwSize: PROCESS_ENTRY_SIZE,
        ..Default::default()
    }
}

fn decode_process_entry(entry: &PROCESSENTRY32W) -> ProcessEntry {
    let name_len = entry
        .szExeFile
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(entry.szExeFile.len());

    ProcessEntry {
        pid: entry.th32ProcessID,
        exe_name: String::from_utf16_lossy(entry.szExeFile.get(..name_len).unwrap_or_default()),
    }
}

/// Recovers the Win32 error code from the HRESULT that the `windows` crate reports.
fn os_error(error: &windows::core::Error) -> OsError {
    #[expect(
        clippy::cast_sign_loss,
        reason = "HRESULT is a bit pattern, the sign has no meaning"
    )]
    let hresult = error.code().0 as u32;

    let code = if hresult & 0xFFFF_0000 == FACILITY_WIN32_PREFIX {
        hresult & 0xFFFF
    } else {
        hresult
    };

    OsError::new(code).with_message(error.message())
}
