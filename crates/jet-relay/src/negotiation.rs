//! Candidate negotiation state machine.
//!
//! Pure bookkeeping: the registry drives it under the association lock and
//! performs all I/O outside of it.

use serde::Serialize;
use uuid::Uuid;

use crate::association::RegistryError;
use crate::candidate::Role;
use crate::forwarder::TerminationReason;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    NegotiationTimeout,
    DialFailed,
    Terminated,
    SessionEnded(TerminationReason),
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::NegotiationTimeout => "negotiation_timeout",
            CloseReason::DialFailed => "dial_failed",
            CloseReason::Terminated => "terminated",
            CloseReason::SessionEnded(_) => "session_ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NegotiationState {
    AwaitingCandidates,
    Testing,
    Selected,
    Relaying,
    Closed { reason: CloseReason },
}

impl NegotiationState {
    pub fn is_closed(&self) -> bool {
        matches!(self, NegotiationState::Closed { .. })
    }

    /// Still accepting new candidates for unbound roles
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            NegotiationState::AwaitingCandidates | NegotiationState::Testing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    /// Tested with `jet_ct=close`; waiting for the same candidate to reconnect
    Reserved(Uuid),
    Bound(Uuid),
}

/// How a candidate entered the association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Open,
    /// Reconnection of a candidate that already passed its test
    Reserved,
}

/// What to do with a candidate's slot once it is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Bind,
    Reserve,
}

#[derive(Debug)]
pub struct Negotiation {
    association_id: Uuid,
    state: NegotiationState,
    client: Slot,
    server: Slot,
    /// Candidates currently attached or holding a slot, per role
    client_present: usize,
    server_present: usize,
    dialed: bool,
}

impl Negotiation {
    pub fn new(association_id: Uuid) -> Self {
        Self {
            association_id,
            state: NegotiationState::AwaitingCandidates,
            client: Slot::Empty,
            server: Slot::Empty,
            client_present: 0,
            server_present: 0,
            dialed: false,
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    fn slot(&self, role: Role) -> Slot {
        match role {
            Role::Client => self.client,
            Role::Server => self.server,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Slot {
        match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
        }
    }

    /// Decide whether a candidate may compete for `role`
    pub fn check_admission(&self, role: Role, candidate_id: Uuid) -> Result<Admission, RegistryError> {
        let slot = self.slot(role);
        match &self.state {
            NegotiationState::Closed { .. } => Err(RegistryError::AssociationClosed(self.association_id)),
            NegotiationState::Selected | NegotiationState::Relaying => match slot {
                Slot::Empty => Err(RegistryError::AlreadySelected(self.association_id)),
                _ => Err(RegistryError::RoleAlreadyFilled(role)),
            },
            NegotiationState::AwaitingCandidates | NegotiationState::Testing => match slot {
                Slot::Empty => Ok(Admission::Open),
                Slot::Reserved(reserved) if reserved == candidate_id => Ok(Admission::Reserved),
                Slot::Reserved(_) | Slot::Bound(_) => Err(RegistryError::RoleAlreadyFilled(role)),
            },
        }
    }

    fn presence_mut(&mut self, role: Role) -> &mut usize {
        match role {
            Role::Client => &mut self.client_present,
            Role::Server => &mut self.server_present,
        }
    }

    /// Note that a candidate for `role` is attached
    pub fn mark_present(&mut self, role: Role) {
        *self.presence_mut(role) += 1;
        self.update_testing();
    }

    /// Undo `mark_present` for a candidate that left before claiming its slot
    pub fn withdraw(&mut self, role: Role) {
        let present = self.presence_mut(role);
        *present = present.saturating_sub(1);
        self.update_testing();
    }

    /// The forward dial succeeded; testing starts without a second side
    pub fn mark_dialed(&mut self) {
        self.dialed = true;
        self.update_testing();
    }

    fn update_testing(&mut self) {
        let ready = self.dialed || (self.client_present > 0 && self.server_present > 0);
        match self.state {
            NegotiationState::AwaitingCandidates if ready => self.state = NegotiationState::Testing,
            NegotiationState::Testing if !ready => self.state = NegotiationState::AwaitingCandidates,
            _ => {}
        }
    }

    /// Take `role` for a candidate that finished its test.
    ///
    /// Returns true once both roles are bound.
    pub fn claim(&mut self, role: Role, candidate_id: Uuid, claim: Claim) -> Result<bool, RegistryError> {
        // the slot may have been taken while this candidate was being tested
        let admission = self.check_admission(role, candidate_id)?;
        if admission == Admission::Reserved && claim == Claim::Reserve {
            return Ok(false);
        }

        *self.slot_mut(role) = match claim {
            Claim::Bind => Slot::Bound(candidate_id),
            Claim::Reserve => Slot::Reserved(candidate_id),
        };

        Ok(matches!((self.client, self.server), (Slot::Bound(_), Slot::Bound(_))))
    }

    pub fn bound(&self, role: Role) -> Option<Uuid> {
        match self.slot(role) {
            Slot::Bound(id) => Some(id),
            _ => None,
        }
    }

    pub fn select(&mut self) -> bool {
        if self.state.is_negotiating() && self.bound(Role::Client).is_some() && self.bound(Role::Server).is_some() {
            self.state = NegotiationState::Selected;
            true
        } else {
            false
        }
    }

    pub fn start_relaying(&mut self) -> bool {
        if self.state == NegotiationState::Selected {
            self.state = NegotiationState::Relaying;
            true
        } else {
            false
        }
    }

    /// Move to Closed. Returns false when already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state.is_closed() {
            return false;
        }
        self.state = NegotiationState::Closed { reason };
        true
    }

    /// Close only while candidates are still being negotiated
    pub fn close_if_negotiating(&mut self, reason: CloseReason) -> bool {
        self.state.is_negotiating() && self.close(reason)
    }
}
