//! One binding pass: pick the target processor, find the target processes, bind each of them.

use std::fmt;

use derive_more::derive::Display;
use tracing::{info, warn};

use crate::pal::BindingsFacade;
use crate::{
    AllowList, CoreBinder, CoreIndex, Error, OsError, PassNumber, ProcessFinder, ProcessId, Result,
    TopologyProbe,
};

/// How the target processor of a pass was chosen.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum SelectionStrategy {
    /// The first efficiency processor reported by the processor topology.
    #[display("efficiency processor")]
    EfficiencyCore,

    /// The highest-numbered logical processor, used when no efficiency processor is known.
    #[display("highest logical processor")]
    HighestCore,
}

/// The processor that every target process of one pass is bound to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetCore {
    core: CoreIndex,
    strategy: SelectionStrategy,
    fallback_reason: Option<Error>,
}

impl TargetCore {
    /// The chosen processor.
    #[must_use]
    pub fn core(&self) -> CoreIndex {
        self.core
    }

    /// How the processor was chosen.
    #[must_use]
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Why the efficiency processor could not be used, if the fallback was taken.
    #[must_use]
    pub fn fallback_reason(&self) -> Option<&Error> {
        self.fallback_reason.as_ref()
    }
}

/// Result of binding one target process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BindingOutcome {
    pid: ProcessId,
    name: String,
    result: Result<()>,
}

impl BindingOutcome {
    /// The process the binding was attempted for.
    #[must_use]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Executable name the process was matched by.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Ok` if the process is now bound, otherwise the step that failed and why.
    pub fn result(&self) -> &Result<()> {
        &self.result
    }

    /// Whether the process is now bound.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// What happened to the target processes of one pass.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PassOutcome {
    /// The running processes could not be enumerated, so nothing was bound.
    Aborted(Error),

    /// No running process matched the allow-list.
    NoTargets,

    /// Every matched process had a binding attempt, in snapshot order.
    Completed(Vec<BindingOutcome>),
}

/// The immutable report of one finished pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PassSummary {
    pass_number: PassNumber,
    target: TargetCore,
    outcome: PassOutcome,
}

impl PassSummary {
    /// Sequence number of the pass, starting from 1.
    #[must_use]
    pub fn pass_number(&self) -> PassNumber {
        self.pass_number
    }

    /// The processor the pass bound processes to.
    #[must_use]
    pub fn target(&self) -> &TargetCore {
        &self.target
    }

    /// What happened to the target processes.
    #[must_use]
    pub fn outcome(&self) -> &PassOutcome {
        &self.outcome
    }

    /// Per-process results, empty unless the pass got as far as binding.
    #[must_use]
    pub fn bindings(&self) -> &[BindingOutcome] {
        match &self.outcome {
            PassOutcome::Completed(outcomes) => outcomes.as_slice(),
            PassOutcome::Aborted(_) | PassOutcome::NoTargets => &[],
        }
    }

    /// Number of processes a binding was attempted for.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.bindings().len()
    }

    /// Number of processes that were bound successfully.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.bindings()
            .iter()
            .filter(|outcome| outcome.is_success())
            .count()
    }

    /// Whether process enumeration failed and the pass was cut short.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, PassOutcome::Aborted(_))
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pass {}: processor {} ({})",
            self.pass_number, self.target.core, self.target.strategy
        )?;

        match &self.outcome {
            PassOutcome::Aborted(e) => write!(f, ", aborted: {e}"),
            PassOutcome::NoTargets => write!(f, ", no target processes running"),
            PassOutcome::Completed(_) => write!(
                f,
                ", {} of {} processes bound",
                self.succeeded(),
                self.attempted()
            ),
        }
    }
}

/// Runs binding passes.
///
/// Holds no state between passes. Each pass queries the processor topology and the process list
/// afresh.
#[derive(Clone, Debug)]
pub struct BindingCycle {
    probe: TopologyProbe,
    finder: ProcessFinder,
    binder: CoreBinder,
}

impl BindingCycle {
    /// Creates a binding cycle that acts on the running system.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bindings(BindingsFacade::target())
    }

    pub(crate) fn with_bindings(bindings: BindingsFacade) -> Self {
        Self {
            probe: TopologyProbe::with_bindings(bindings.clone()),
            finder: ProcessFinder::with_bindings(bindings.clone()),
            binder: CoreBinder::with_bindings(bindings),
        }
    }

    /// The topology probe used to pick target processors.
    #[must_use]
    pub fn probe(&self) -> &TopologyProbe {
        &self.probe
    }

    /// Picks the processor to bind to in this pass.
    ///
    /// Prefers the first efficiency processor. If the topology cannot be read or has no
    /// efficiency processors, falls back to the highest-numbered of `total_cores` logical
    /// processors (a count of 0 is treated as 1). Never fails.
    #[must_use]
    pub fn resolve_target_core(&self, total_cores: usize) -> TargetCore {
        match self.probe.discover_efficient_cores() {
            Ok(cores) => {
                info!(efficient_cores = %cores, "using first efficiency processor");

                TargetCore {
                    core: cores.first(),
                    strategy: SelectionStrategy::EfficiencyCore,
                    fallback_reason: None,
                }
            }
            Err(e) => {
                let core = CoreIndex::try_from(total_cores.max(1).saturating_sub(1))
                    .unwrap_or(CoreIndex::MAX);

                info!(
                    reason = %e,
                    total_cores,
                    core,
                    "no efficiency processor available, using highest logical processor"
                );

                TargetCore {
                    core,
                    strategy: SelectionStrategy::HighestCore,
                    fallback_reason: Some(e),
                }
            }
        }
    }

    /// Runs one pass: resolves the target processor, finds the processes on `allow_list` and
    /// binds each of them.
    ///
    /// A failure to bind one process does not stop the others. Errors never escape: they are
    /// reported through the returned summary.
    #[must_use]
    pub fn run_once(
        &self,
        pass_number: PassNumber,
        allow_list: &AllowList,
        total_cores: usize,
    ) -> PassSummary {
        info!(pass_number, "starting binding pass");

        let target = self.resolve_target_core(total_cores);

        let processes = match self.finder.find_processes(allow_list) {
            Ok(processes) => processes,
            Err(e) => {
                warn!(pass_number, error = %e, "binding pass aborted");

                return PassSummary {
                    pass_number,
                    target,
                    outcome: PassOutcome::Aborted(e),
                };
            }
        };

        if processes.is_empty() {
            info!(pass_number, names = %allow_list, "no target processes running");

            return PassSummary {
                pass_number,
                target,
                outcome: PassOutcome::NoTargets,
            };
        }

        info!(
            pass_number,
            pids = ?processes.iter().map(|p| p.pid).collect::<Vec<_>>(),
            "found target processes"
        );

        let mut access_denied = false;

        let outcomes: Vec<BindingOutcome> = processes
            .into_iter()
            .map(|process| {
                let result = self.binder.bind(process.pid, target.core);

                match &result {
                    Ok(()) => info!(
                        pid = process.pid,
                        name = %process.name,
                        core = target.core,
                        "process bound at idle priority"
                    ),
                    Err(e) => {
                        access_denied |= e.os_error().is_some_and(OsError::is_access_denied);
                        warn!(
                            pid = process.pid,
                            name = %process.name,
                            error = %e,
                            "failed to bind process"
                        );
                    }
                }

                BindingOutcome {
                    pid: process.pid,
                    name: process.name,
                    result,
                }
            })
            .collect();

        if access_denied {
            warn!("some processes refused access; run as administrator to bind them");
        }

        let summary = PassSummary {
            pass_number,
            target,
            outcome: PassOutcome::Completed(outcomes),
        };

        info!(
            pass_number,
            attempted = summary.attempted(),
            succeeded = summary.succeeded(),
            "binding pass finished"
        );

        summary
    }
}

impl Default for BindingCycle {
    fn default() -> Self {
        Self::new()
    }
}
