//! Discovers which logical processors the operating system marks as efficiency processors.

mod records;

use std::fmt;

use nonempty::NonEmpty;
use tracing::debug;

#[cfg(test)]
pub(crate) use records::TopologyBufferBuilder;
use records::RecordReader;

use crate::pal::{Bindings, BindingsFacade, RELATION_PROCESSOR_CORE};
use crate::{CoreIndex, Error, OsError, Result};

/// Bit in `PROCESSOR_RELATIONSHIP::Flags` that marks a core as an efficiency core.
pub(crate) const EFFICIENCY_CORE_FLAG: u8 = 0x04;

/// How many times we ask for the topology before giving up. The set of processors can change
/// between the size probe and the fill call, in which case the fill call asks for more space.
const MAX_QUERY_ATTEMPTS: usize = 4;

/// The logical processors found by one topology query to be efficiency processors.
///
/// Indexes are in the order the operating system reported them and contain no duplicates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EfficientCoreSet {
    cores: NonEmpty<CoreIndex>,
}

impl EfficientCoreSet {
    /// The first discovered efficiency processor, which is the one we bind processes to.
    #[must_use]
    pub fn first(&self) -> CoreIndex {
        *self.cores.first()
    }

    /// Number of efficiency processors in the set.
    #[must_use]
    #[allow(clippy::len_without_is_empty, reason = "the set is never empty")]
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    /// Iterates over the processors in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = CoreIndex> + '_ {
        self.cores.iter().copied()
    }
}

impl fmt::Display for EfficientCoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, core) in self.iter().enumerate() {
            if position > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{core}")?;
        }

        Ok(())
    }
}

/// Reads the processor topology from the operating system.
#[derive(Clone, Debug)]
pub struct TopologyProbe {
    bindings: BindingsFacade,
}

impl TopologyProbe {
    /// Creates a probe that queries the operating system the build targets.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bindings(BindingsFacade::target())
    }

    pub(crate) fn with_bindings(bindings: BindingsFacade) -> Self {
        Self { bindings }
    }

    /// Returns the efficiency processors of the first core record that has any.
    ///
    /// Only the first qualifying record is used: once it yields at least one processor the scan
    /// stops and later records are ignored.
    ///
    /// # Errors
    ///
    /// [`Error::TopologyQueryFailed`] if the operating system refuses either part of the query,
    /// [`Error::NoEfficientCoresFound`] if the topology was read but no core is marked as an
    /// efficiency core (for example on processors with only one kind of core).
    pub fn discover_efficient_cores(&self) -> Result<EfficientCoreSet> {
        let buffer = self.query_processor_information(RELATION_PROCESSOR_CORE)?;
        efficient_cores_in(&buffer)
    }

    /// Total number of active logical processors on the machine, never less than 1.
    #[must_use]
    pub fn logical_processor_count(&self) -> usize {
        usize::try_from(self.bindings.get_active_processor_count())
            .unwrap_or(usize::MAX)
            .max(1)
    }

    /// Performs the size-probe-then-fill dance of `GetLogicalProcessorInformationEx()`.
    ///
    /// The size probe is expected to fail with `ERROR_INSUFFICIENT_BUFFER` and any other outcome
    /// is an error. The fill call is retried if it reports that the buffer became too small.
    fn query_processor_information(&self, relationship: u32) -> Result<Vec<u8>> {
        for _ in 0..MAX_QUERY_ATTEMPTS {
            let mut required_length: u32 = 0;

            match self.bindings.get_logical_processor_information_ex(
                relationship,
                &mut [],
                &mut required_length,
            ) {
                Err(e) if e.is_insufficient_buffer() => {}
                Err(e) => return Err(Error::TopologyQueryFailed(e)),
                Ok(()) => {
                    return Err(Error::TopologyQueryFailed(
                        OsError::new(0).with_message("size probe unexpectedly succeeded"),
                    ));
                }
            }

            let required_length = usize::try_from(required_length).unwrap_or_default();

            if required_length == 0 {
                return Err(Error::TopologyQueryFailed(
                    OsError::new(OsError::ERROR_INSUFFICIENT_BUFFER)
                        .with_message("size probe reported a required length of zero"),
                ));
            }

            let mut buffer = vec![0_u8; required_length];
            let mut final_length: u32 = 0;

            match self.bindings.get_logical_processor_information_ex(
                relationship,
                &mut buffer,
                &mut final_length,
            ) {
                Ok(()) => {
                    buffer.truncate(usize::try_from(final_length).unwrap_or(usize::MAX));
                    debug!(bytes = buffer.len(), "read processor topology");
                    return Ok(buffer);
                }
                Err(e) if e.is_insufficient_buffer() => {
                    debug!(
                        required_length,
                        "processor topology grew between size probe and fill, retrying"
                    );
                }
                Err(e) => return Err(Error::TopologyQueryFailed(e)),
            }
        }

        Err(Error::TopologyQueryFailed(
            OsError::new(OsError::ERROR_INSUFFICIENT_BUFFER)
                .with_message("processor topology kept changing size"),
        ))
    }
}

impl Default for TopologyProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans a raw `RelationProcessorCore` buffer for the first core record flagged as an efficiency
/// core and returns the logical processors of that record.
pub(crate) fn efficient_cores_in(buffer: &[u8]) -> Result<EfficientCoreSet> {
    let mut reader = RecordReader::new(buffer);
    let mut cores: Vec<CoreIndex> = Vec::new();

    for record in reader.by_ref() {
        let Some(processor) = record.as_processor(RELATION_PROCESSOR_CORE) else {
            continue;
        };

        if processor.flags() & EFFICIENCY_CORE_FLAG == 0 {
            continue;
        }

        debug!(
            efficiency_class = processor.efficiency_class(),
            group_count = processor.group_count(),
            "found efficiency core record"
        );

        for affinity in processor.group_affinities() {
            for core in affinity.processor_indexes() {
                if !cores.contains(&core) {
                    cores.push(core);
                }
            }
        }

        if !cores.is_empty() {
            break;
        }
    }

    if reader.stopped_early() {
        debug!(
            unread_bytes = reader.remaining_len(),
            "processor topology scan stopped at a malformed record"
        );
    }

    NonEmpty::from_vec(cores)
        .map(|cores| EfficientCoreSet { cores })
        .ok_or(Error::NoEfficientCoresFound)
}

/// Configures `bindings` to answer one size probe and one fill call with `buffer`.
#[cfg(test)]
pub(crate) fn simulate_topology(bindings: &mut crate::pal::MockBindings, buffer: Vec<u8>) {
    let mut seq = mockall::Sequence::new();
    let length = u32::try_from(buffer.len()).unwrap();

    bindings
        .expect_get_logical_processor_information_ex()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|relationship, buffer, _| {
            *relationship == RELATION_PROCESSOR_CORE && buffer.is_empty()
        })
        .returning(move |_, _, returned_length| {
            *returned_length = length;
            Err(OsError::new(OsError::ERROR_INSUFFICIENT_BUFFER))
        });

    bindings
        .expect_get_logical_processor_information_ex()
        .times(1)
        .in_sequence(&mut seq)
        .withf(move |relationship, buffer, _| {
            *relationship == RELATION_PROCESSOR_CORE && buffer.len() == length as usize
        })
        .returning(move |_, target, returned_length| {
            target.copy_from_slice(&buffer);
            *returned_length = length;
            Ok(())
        });
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use itertools::Itertools;
    use mockall::Sequence;

    use super::*;
    use crate::pal::MockBindings;

    const P_CORE: u8 = 0;
    const E_CORE: u8 = EFFICIENCY_CORE_FLAG;
    const SMT: u8 = 0x01;

    #[test]
    fn hybrid_processor_reports_first_efficiency_record() {
        // 2 P-cores with SMT (processors 0-3) followed by two E-core clusters.
        let buffer = TopologyBufferBuilder::new()
            .processor_core(P_CORE | SMT, &[(0, 0b0000_0011)])
            .processor_core(P_CORE | SMT, &[(0, 0b0000_1100)])
            .processor_core(E_CORE, &[(0, 0b0011_0000)])
            .processor_core(E_CORE, &[(0, 0b1100_0000)])
            .build();

        let cores = efficient_cores_in(&buffer).unwrap();

        assert_eq!(cores.iter().collect_vec(), vec![4, 5]);
        assert_eq!(cores.first(), 4);
        assert_eq!(cores.len(), 2);
        assert_eq!(cores.to_string(), "4, 5");
    }

    #[test]
    fn efficiency_record_spanning_groups() {
        let buffer = TopologyBufferBuilder::new()
            .processor_core(P_CORE, &[(0, 0b1)])
            .processor_core(E_CORE, &[(0, 1 << 63), (1, 0b101)])
            .build();

        let cores = efficient_cores_in(&buffer).unwrap();

        assert_eq!(cores.iter().collect_vec(), vec![63, 64, 66]);
    }

    #[test]
    fn duplicate_group_entries_do_not_duplicate_cores() {
        let buffer = TopologyBufferBuilder::new()
            .processor_core(E_CORE, &[(0, 0b11), (0, 0b10)])
            .build();

        let cores = efficient_cores_in(&buffer).unwrap();

        assert_eq!(cores.iter().collect_vec(), vec![0, 1]);
        assert!(cores.iter().all_unique());
    }

    #[test]
    fn flagged_record_with_empty_mask_does_not_stop_scan() {
        let buffer = TopologyBufferBuilder::new()
            .processor_core(E_CORE, &[(0, 0)])
            .processor_core(E_CORE, &[(0, 0b1000)])
            .build();

        let cores = efficient_cores_in(&buffer).unwrap();

        assert_eq!(cores.iter().collect_vec(), vec![3]);
    }

    #[test]
    fn no_flagged_records_is_not_found() {
        let buffer = TopologyBufferBuilder::new()
            .processor_core(P_CORE | SMT, &[(0, 0b0011)])
            .processor_core(P_CORE | SMT, &[(0, 0b1100)])
            .build();

        assert_eq!(
            efficient_cores_in(&buffer),
            Err(Error::NoEfficientCoresFound)
        );
    }

    #[test]
    fn empty_buffer_is_not_found() {
        assert_eq!(efficient_cores_in(&[]), Err(Error::NoEfficientCoresFound));
    }

    #[test]
    fn zero_length_record_terminates_before_later_efficiency_record() {
        let buffer = TopologyBufferBuilder::new()
            .processor_core(P_CORE, &[(0, 0b1)])
            .raw_header(RELATION_PROCESSOR_CORE, 0, 40)
            .processor_core(E_CORE, &[(0, 0b10)])
            .build();

        assert_eq!(
            efficient_cores_in(&buffer),
            Err(Error::NoEfficientCoresFound)
        );
    }

    #[test]
    fn other_relationship_kinds_are_skipped() {
        const RELATION_CACHE: u32 = 2;

        let buffer = TopologyBufferBuilder::new()
            .processor_record(RELATION_CACHE, E_CORE, &[(0, 0b1)])
            .processor_core(E_CORE, &[(0, 0b100)])
            .build();

        let cores = efficient_cores_in(&buffer).unwrap();

        assert_eq!(cores.iter().collect_vec(), vec![2]);
    }

    #[test]
    fn discover_via_bindings() {
        let mut bindings = MockBindings::new();
        simulate_topology(
            &mut bindings,
            TopologyBufferBuilder::new()
                .processor_core(P_CORE, &[(0, 0b1)])
                .processor_core(E_CORE, &[(0, 0b110)])
                .build(),
        );

        let probe = TopologyProbe::with_bindings(bindings.into());
        let cores = probe.discover_efficient_cores().unwrap();

        assert_eq!(cores.iter().collect_vec(), vec![1, 2]);
    }

    #[test]
    fn size_probe_failure_is_query_error() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_get_logical_processor_information_ex()
            .times(1)
            .returning(|_, _, _| Err(OsError::new(OsError::ERROR_ACCESS_DENIED)));

        let probe = TopologyProbe::with_bindings(bindings.into());

        assert_eq!(
            probe.discover_efficient_cores(),
            Err(Error::TopologyQueryFailed(OsError::new(
                OsError::ERROR_ACCESS_DENIED
            )))
        );
    }

    #[test]
    fn size_probe_success_is_query_error() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_get_logical_processor_information_ex()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let probe = TopologyProbe::with_bindings(bindings.into());

        assert!(matches!(
            probe.discover_efficient_cores(),
            Err(Error::TopologyQueryFailed(_))
        ));
    }

    #[test]
    fn fill_failure_is_query_error() {
        let mut bindings = MockBindings::new();
        let mut seq = Sequence::new();

        bindings
            .expect_get_logical_processor_information_ex()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, buffer, _| buffer.is_empty())
            .returning(|_, _, returned_length| {
                *returned_length = 48;
                Err(OsError::new(OsError::ERROR_INSUFFICIENT_BUFFER))
            });

        bindings
            .expect_get_logical_processor_information_ex()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, buffer, _| buffer.len() == 48)
            .returning(|_, _, _| Err(OsError::new(OsError::ERROR_INVALID_PARAMETER)));

        let probe = TopologyProbe::with_bindings(bindings.into());

        assert_eq!(
            probe.discover_efficient_cores(),
            Err(Error::TopologyQueryFailed(OsError::new(
                OsError::ERROR_INVALID_PARAMETER
            )))
        );
    }

    #[test]
    fn insufficient_buffer_on_fill_is_retried() {
        let first_size = TopologyBufferBuilder::new()
            .processor_core(P_CORE, &[(0, 0b1)])
            .build()
            .len();
        let final_buffer = TopologyBufferBuilder::new()
            .processor_core(P_CORE, &[(0, 0b1)])
            .processor_core(E_CORE, &[(0, 0b10)])
            .build();
        let final_size = final_buffer.len();

        // The topology grows between the first size probe and the first fill call.
        let mut call: usize = 0;

        let mut bindings = MockBindings::new();
        bindings
            .expect_get_logical_processor_information_ex()
            .times(4)
            .returning(move |_, buffer, returned_length| {
                call += 1;

                match call {
                    1 => {
                        assert!(buffer.is_empty());
                        *returned_length = u32::try_from(first_size).unwrap();
                        Err(OsError::new(OsError::ERROR_INSUFFICIENT_BUFFER))
                    }
                    2 => {
                        assert_eq!(buffer.len(), first_size);
                        *returned_length = u32::try_from(final_size).unwrap();
                        Err(OsError::new(OsError::ERROR_INSUFFICIENT_BUFFER))
                    }
                    3 => {
                        assert!(buffer.is_empty());
                        *returned_length = u32::try_from(final_size).unwrap();
                        Err(OsError::new(OsError::ERROR_INSUFFICIENT_BUFFER))
                    }
                    _ => {
                        buffer.copy_from_slice(&final_buffer);
                        *returned_length = u32::try_from(final_size).unwrap();
                        Ok(())
                    }
                }
            });

        let probe = TopologyProbe::with_bindings(bindings.into());
        let cores = probe.discover_efficient_cores().unwrap();

        assert_eq!(cores.iter().collect_vec(), vec![1]);
    }

    #[test]
    fn gives_up_when_topology_keeps_growing() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_get_logical_processor_information_ex()
            .times(MAX_QUERY_ATTEMPTS * 2)
            .returning(|_, _, returned_length| {
                *returned_length = 64;
                Err(OsError::new(OsError::ERROR_INSUFFICIENT_BUFFER))
            });

        let probe = TopologyProbe::with_bindings(bindings.into());

        assert!(matches!(
            probe.discover_efficient_cores(),
            Err(Error::TopologyQueryFailed(e)) if e.code() == OsError::ERROR_INSUFFICIENT_BUFFER
        ));
    }

    #[test]
    fn logical_processor_count_is_at_least_one() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_get_active_processor_count()
            .return_const(0_u32);
        assert_eq!(
            TopologyProbe::with_bindings(bindings.into()).logical_processor_count(),
            1
        );

        let mut bindings = MockBindings::new();
        bindings
            .expect_get_active_processor_count()
            .return_const(20_u32);
        assert_eq!(
            TopologyProbe::with_bindings(bindings.into()).logical_processor_count(),
            20
        );
    }
}
