/// Identifies one logical processor in the flat global numbering used by this crate.
///
/// The value is `group_index * 64 + index_in_group`, matching the numbering that Windows uses
/// for processors when processor groups are flattened. It is stable for the lifetime of one OS
/// boot but may differ between boots.
pub type CoreIndex = u32;

/// Operating system identifier of a process.
///
/// The operating system reuses identifiers after a process exits, so a `ProcessId` is only
/// meaningful for a short time after it was observed.
pub type ProcessId = u32;

/// Sequence number of one binding pass, starting from 1 for the first pass of the program.
pub type PassNumber = u64;

/// Number of processors that fit into the affinity mask of a single processor group.
pub(crate) const PROCESSORS_PER_GROUP: u32 = 64;
