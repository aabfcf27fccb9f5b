//! Replica-set coordinator contract.
//!
//! Elections, heartbeats and configuration live elsewhere; the pipeline
//! only needs the term, the member state, the progress setters and the
//! drain signal. [`LocalCoordinator`] is the in-process implementation
//! used by embedders and tests.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

use crate::core::OpTimeAndWall;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    Startup,
    Recovering,
    Secondary,
    Primary,
    Rollback,
}

impl MemberState {
    pub fn is_readable(self) -> bool {
        matches!(self, MemberState::Primary | MemberState::Secondary)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberState::Startup => "STARTUP",
            MemberState::Recovering => "RECOVERING",
            MemberState::Secondary => "SECONDARY",
            MemberState::Primary => "PRIMARY",
            MemberState::Rollback => "ROLLBACK",
        };
        f.write_str(name)
    }
}

/// Whether the applier should keep consuming batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplierState {
    Running,
    Draining,
    /// The node won an election; applying replicated ops would race its
    /// own writes. Batches must fail.
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataConsistency {
    Consistent,
    Inconsistent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("cannot transition from {from} to {to}")]
    InvalidTransition { from: MemberState, to: MemberState },
}

pub trait ReplicationCoordinator: Send + Sync {
    fn term(&self) -> i64;

    fn member_state(&self) -> MemberState;

    fn can_accept_writes(&self) -> bool {
        self.member_state() == MemberState::Primary
    }

    fn in_maintenance_mode(&self) -> bool;

    /// Change follower state. Only RECOVERING <-> SECONDARY moves are the
    /// pipeline's business; anything else is the election subsystem's.
    fn set_follower_mode(&self, target: MemberState) -> Result<(), CoordinatorError>;

    fn last_applied(&self) -> OpTimeAndWall;

    fn last_durable(&self) -> OpTimeAndWall;

    /// Forward-only: an older optime than the current value is a no-op.
    /// This setter races the transition to primary, hence forward-only
    /// rather than an assignment.
    fn set_last_applied_forward(&self, opt: OpTimeAndWall, consistency: DataConsistency);

    /// Forward-only, and `last_durable <= last_applied` always holds.
    fn set_last_durable_forward(&self, opt: OpTimeAndWall);

    fn applier_state(&self) -> ApplierState;

    /// The buffer ran dry while draining. `term` is the term observed
    /// before the wait, so a signal from a stale term is distinguishable.
    fn signal_drain_complete(&self, term: i64);

    /// How far behind the primary this member intentionally stays.
    fn slave_delay(&self) -> Duration;
}

#[derive(Debug)]
struct CoordinatorState {
    term: i64,
    member_state: MemberState,
    maintenance: bool,
    applier_state: ApplierState,
    last_applied: OpTimeAndWall,
    last_durable: OpTimeAndWall,
    consistency: DataConsistency,
    drain_signals: Vec<i64>,
    slave_delay: Duration,
}

/// In-process coordinator with plain state and test accessors.
#[derive(Debug)]
pub struct LocalCoordinator {
    state: Mutex<CoordinatorState>,
}

impl LocalCoordinator {
    pub fn new(term: i64, member_state: MemberState) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                term,
                member_state,
                maintenance: false,
                applier_state: ApplierState::Running,
                last_applied: OpTimeAndWall::default(),
                last_durable: OpTimeAndWall::default(),
                consistency: DataConsistency::Inconsistent,
                drain_signals: Vec::new(),
                slave_delay: Duration::ZERO,
            }),
        }
    }

    pub fn recovering() -> Self {
        Self::new(1, MemberState::Recovering)
    }

    pub fn set_term(&self, term: i64) {
        self.state.lock().expect("coordinator poisoned").term = term;
    }

    pub fn set_member_state(&self, state: MemberState) {
        self.state.lock().expect("coordinator poisoned").member_state = state;
    }

    pub fn set_maintenance_mode(&self, on: bool) {
        self.state.lock().expect("coordinator poisoned").maintenance = on;
    }

    pub fn set_applier_state(&self, state: ApplierState) {
        self.state.lock().expect("coordinator poisoned").applier_state = state;
    }

    pub fn set_slave_delay(&self, delay: Duration) {
        self.state.lock().expect("coordinator poisoned").slave_delay = delay;
    }

    pub fn consistency(&self) -> DataConsistency {
        self.state.lock().expect("coordinator poisoned").consistency
    }

    /// Terms at which drain-complete was signaled, in order.
    pub fn drain_signals(&self) -> Vec<i64> {
        self.state
            .lock()
            .expect("coordinator poisoned")
            .drain_signals
            .clone()
    }
}

impl ReplicationCoordinator for LocalCoordinator {
    fn term(&self) -> i64 {
        self.state.lock().expect("coordinator poisoned").term
    }

    fn member_state(&self) -> MemberState {
        self.state.lock().expect("coordinator poisoned").member_state
    }

    fn in_maintenance_mode(&self) -> bool {
        self.state.lock().expect("coordinator poisoned").maintenance
    }

    fn set_follower_mode(&self, target: MemberState) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock().expect("coordinator poisoned");
        let allowed = matches!(
            (state.member_state, target),
            (MemberState::Recovering, MemberState::Secondary)
                | (MemberState::Secondary, MemberState::Recovering)
                | (MemberState::Startup, MemberState::Recovering)
        );
        if !allowed {
            return Err(CoordinatorError::InvalidTransition {
                from: state.member_state,
                to: target,
            });
        }
        tracing::info!(from = %state.member_state, to = %target, "member state transition");
        state.member_state = target;
        Ok(())
    }

    fn last_applied(&self) -> OpTimeAndWall {
        self.state.lock().expect("coordinator poisoned").last_applied
    }

    fn last_durable(&self) -> OpTimeAndWall {
        self.state.lock().expect("coordinator poisoned").last_durable
    }

    fn set_last_applied_forward(&self, opt: OpTimeAndWall, consistency: DataConsistency) {
        let mut state = self.state.lock().expect("coordinator poisoned");
        if opt.optime > state.last_applied.optime {
            state.last_applied = opt;
        }
        state.consistency = consistency;
    }

    fn set_last_durable_forward(&self, opt: OpTimeAndWall) {
        let mut state = self.state.lock().expect("coordinator poisoned");
        let ceiling = state.last_applied.optime;
        if opt.optime > state.last_durable.optime && opt.optime <= ceiling {
            state.last_durable = opt;
        }
    }

    fn applier_state(&self) -> ApplierState {
        self.state.lock().expect("coordinator poisoned").applier_state
    }

    fn signal_drain_complete(&self, term: i64) {
        let mut state = self.state.lock().expect("coordinator poisoned");
        if state.applier_state != ApplierState::Draining {
            return;
        }
        // A signal computed before a term change reflects a stale buffer
        // observation and must be ignored.
        if term != state.term {
            tracing::info!(
                stale_term = term,
                current_term = state.term,
                "ignoring drain-complete signal from a previous term"
            );
            return;
        }
        state.drain_signals.push(term);
        state.applier_state = ApplierState::Stopped;
    }

    fn slave_delay(&self) -> Duration {
        self.state.lock().expect("coordinator poisoned").slave_delay
    }
}
