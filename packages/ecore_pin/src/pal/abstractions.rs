use std::fmt::Debug;

use crate::{OsError, ProcessId};

/// `LOGICAL_PROCESSOR_RELATIONSHIP::RelationProcessorCore`.
pub(crate) const RELATION_PROCESSOR_CORE: u32 = 0;

/// `PROCESS_SET_INFORMATION` access right, needed to change affinity and priority class.
pub(crate) const PROCESS_SET_INFORMATION: u32 = 0x0200;

/// `PROCESS_QUERY_INFORMATION` access right, needed to read basic process information.
pub(crate) const PROCESS_QUERY_INFORMATION: u32 = 0x0400;

/// `IDLE_PRIORITY_CLASS`, the lowest priority class a process can have.
pub(crate) const IDLE_PRIORITY_CLASS: u32 = 0x0040;

/// An operating system handle, stored as an integer so it can cross the mockable boundary.
///
/// Ownership is not tracked here - see [`OwnedHandle`][crate::pal::OwnedHandle].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct RawHandle(pub(crate) usize);

/// One entry of a process snapshot, decoded from the platform representation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ProcessEntry {
    pub(crate) pid: ProcessId,

    /// Short executable name as reported by the operating system, e.g. `notepad.exe`.
    pub(crate) exe_name: String,
}

/// Bindings for FFI calls into the operating system.
///
/// All PAL FFI calls must go through this trait, enabling them to be mocked. The methods mirror
/// the shape of the underlying Win32 functions so the logic above stays recognizable to anyone
/// who knows those APIs, with platform types replaced by plain integers and owned values.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Bindings: Debug + Send + Sync + 'static {
    /// `GetLogicalProcessorInformationEx()`.
    ///
    /// An empty `buffer` is passed to the operating system as a null pointer, which asks only for
    /// the required buffer size. The required or written size is stored in `returned_length`
    /// both on success and on `ERROR_INSUFFICIENT_BUFFER`.
    fn get_logical_processor_information_ex(
        &self,
        relationship: u32,
        buffer: &mut [u8],
        returned_length: &mut u32,
    ) -> Result<(), OsError>;

    /// `GetActiveProcessorCount(ALL_PROCESSOR_GROUPS)`.
    fn get_active_processor_count(&self) -> u32;

    /// `CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)`.
    fn create_process_snapshot(&self) -> Result<RawHandle, OsError>;

    /// `Process32FirstW()`.
    fn process_first(&self, snapshot: RawHandle) -> Result<ProcessEntry, OsError>;

    /// `Process32NextW()`. Reports `ERROR_NO_MORE_FILES` after the last entry.
    fn process_next(&self, snapshot: RawHandle) -> Result<ProcessEntry, OsError>;

    /// `OpenProcess()` without handle inheritance.
    fn open_process(&self, desired_access: u32, pid: ProcessId) -> Result<RawHandle, OsError>;

    /// `SetProcessAffinityMask()`.
    fn set_process_affinity_mask(&self, process: RawHandle, mask: usize) -> Result<(), OsError>;

    /// `SetPriorityClass()`.
    fn set_priority_class(&self, process: RawHandle, priority_class: u32) -> Result<(), OsError>;

    /// `CloseHandle()`.
    fn close_handle(&self, handle: RawHandle) -> Result<(), OsError>;
}
