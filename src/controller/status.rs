//! Status transaction
//!
//! Several checks of a status pass may each want to move a component's
//! phase. They propose instead of writing; [`StatusTransaction::commit`]
//! picks exactly one proposal and applies it, so a pass never leaves a
//! status written half by one check and half by another.
//!
//! Selection: a Failed or Abnormal proposal beats any other, a proposal
//! carrying a phase beats one that only updates bookkeeping, and ties go to
//! the more specific source (volume expansion, then horizontal scale, then
//! workload readiness). Equal proposals keep the first one made.

use std::fmt;

use tracing::debug;

use crate::crd::{Cluster, ComponentMessageMap, ComponentPhase, ComponentStatus};

/// Check that made a proposal, ordered by specificity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProposalSource {
    Workload,
    HorizontalScale,
    VolumeExpansion,
}

impl fmt::Display for ProposalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalSource::Workload => write!(f, "workload"),
            ProposalSource::HorizontalScale => write!(f, "horizontal-scale"),
            ProposalSource::VolumeExpansion => write!(f, "volume-expansion"),
        }
    }
}

type ApplyFn = Box<dyn FnOnce(&mut ComponentStatus) + Send>;

struct Proposal {
    source: ProposalSource,
    phase: Option<ComponentPhase>,
    apply: ApplyFn,
}

impl Proposal {
    fn rank(&self) -> (bool, bool, ProposalSource) {
        (
            self.phase.is_some_and(|p| p.is_failed_or_abnormal()),
            self.phase.is_some(),
            self.source,
        )
    }
}

/// A committed phase change of one component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseTransition {
    pub component: String,
    pub from: Option<ComponentPhase>,
    pub to: ComponentPhase,
}

impl PhaseTransition {
    pub fn message(&self, detail: &str) -> String {
        let from = self.from.map(|p| p.to_string()).unwrap_or_default();
        format!(
            "Component {} phase changed from '{}' to '{}'. {}",
            self.component, from, self.to, detail
        )
    }
}

pub struct StatusTransaction {
    component: String,
    proposals: Vec<Proposal>,
}

impl StatusTransaction {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            proposals: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    /// Buffer a candidate phase and the status edits that go with it.
    /// `apply` runs only if this proposal is the one committed.
    pub fn propose<F>(&mut self, source: ProposalSource, phase: Option<ComponentPhase>, apply: F)
    where
        F: FnOnce(&mut ComponentStatus) + Send + 'static,
    {
        self.proposals.push(Proposal {
            source,
            phase,
            apply: Box::new(apply),
        });
    }

    /// Apply the winning proposal to the component's status.
    ///
    /// Returns the phase transition it caused, if any. With no proposals the
    /// status is left alone.
    pub fn commit(self, cluster: &mut Cluster) -> Option<PhaseTransition> {
        let mut winner: Option<Proposal> = None;
        for proposal in self.proposals {
            let better = match &winner {
                Some(current) => proposal.rank() > current.rank(),
                None => true,
            };
            if better {
                winner = Some(proposal);
            }
        }
        let winner = winner?;
        debug!(
            component = %self.component,
            source = %winner.source,
            phase = ?winner.phase,
            "Committing status proposal"
        );

        let status = cluster.component_status_mut(&self.component);
        let from = status.phase;
        if let Some(phase) = winner.phase {
            status.phase = Some(phase);
        }
        (winner.apply)(status);

        match status.phase {
            Some(to) if from != Some(to) => Some(PhaseTransition {
                component: self.component,
                from,
                to,
            }),
            _ => None,
        }
    }
}

/// Direct status write: move to `phase` and keep the messages that explain it.
///
/// Messages are only merged when the phase actually changes.
pub fn set_status_phase(
    cluster: &mut Cluster,
    component: &str,
    phase: ComponentPhase,
    messages: Option<&ComponentMessageMap>,
) -> Option<PhaseTransition> {
    let status = cluster.component_status_mut(component);
    let from = status.phase;
    if from == Some(phase) {
        return None;
    }
    status.phase = Some(phase);
    if let Some(messages) = messages {
        status.message.merge(messages);
    }
    Some(PhaseTransition {
        component: component.to_string(),
        from,
        to: phase,
    })
}
