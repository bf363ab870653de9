//! Association registry.
//!
//! One entry per `jet_aid`, each behind its own lock. The lock guards
//! bookkeeping only; handshakes, probes and dials run outside of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jet_token::{AssociationClaims, ConnectionMode, ConnectionTest, TargetAddr};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candidate::{Candidate, Endpoint, Role};
use crate::forwarder::{Forwarder, SessionContext, SessionPolicy, SessionResult};
use crate::metrics::RelayMetrics;
use crate::negotiation::{Admission, Claim, CloseReason, Negotiation, NegotiationState};
use crate::session::{SessionInfo, SessionManager};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown association {0}")]
    UnknownAssociation(Uuid),
    #[error("Association {0} is closed")]
    AssociationClosed(Uuid),
    #[error("Association {0} already exists with different parameters")]
    AssociationConflict(Uuid),
    #[error("Association {0} already selected its candidates")]
    AlreadySelected(Uuid),
    #[error("The {0} role is already filled")]
    RoleAlreadyFilled(Role),
    #[error("The {0} role is not allowed for this association")]
    RoleNotAllowed(Role),
    #[error("Connection test failed: {0}")]
    ConnectionTestFailed(String),
    #[error("Could not reach any destination: {0}")]
    DialFailed(String),
    #[error("Candidate transport failed: {0}")]
    Transport(#[from] std::io::Error),
}

impl RegistryError {
    /// Status used when answering a JET or HTTP peer
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            RegistryError::UnknownAssociation(_) => (404, "Not Found"),
            RegistryError::AssociationClosed(_) => (410, "Gone"),
            RegistryError::AssociationConflict(_)
            | RegistryError::AlreadySelected(_)
            | RegistryError::RoleAlreadyFilled(_) => (409, "Conflict"),
            RegistryError::RoleNotAllowed(_) => (403, "Forbidden"),
            RegistryError::ConnectionTestFailed(_) => (400, "Bad Request"),
            RegistryError::DialFailed(_) | RegistryError::Transport(_) => (502, "Bad Gateway"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub negotiation_timeout: Duration,
    pub connection_test_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(30),
            connection_test_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    pub id: Uuid,
    pub role: Role,
    pub peer: String,
    pub attached_at: DateTime<Utc>,
}

/// Snapshot of an association for listing
#[derive(Debug, Clone, Serialize)]
pub struct AssociationInfo {
    pub id: Uuid,
    pub application_protocol: String,
    pub connection_mode: &'static str,
    #[serde(flatten)]
    pub state: NegotiationState,
    pub created_at: DateTime<Utc>,
    pub destination: Option<String>,
    pub candidates: Vec<CandidateRecord>,
}

struct Association {
    claims: AssociationClaims,
    created_at: DateTime<Utc>,
    candidates: Vec<CandidateRecord>,
    negotiation: Negotiation,
    pending: HashMap<Role, Endpoint>,
    destination: Option<TargetAddr>,
    cancel: CancellationToken,
    state_tx: watch::Sender<NegotiationState>,
}

impl Association {
    fn new(claims: AssociationClaims) -> Self {
        let negotiation = Negotiation::new(claims.association_id);
        let (state_tx, _) = watch::channel(negotiation.state().clone());
        Self {
            claims,
            created_at: Utc::now(),
            candidates: Vec::new(),
            negotiation,
            pending: HashMap::new(),
            destination: None,
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    fn id(&self) -> Uuid {
        self.claims.association_id
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.negotiation.state().clone());
    }

    fn check_compatible(&self, claims: &AssociationClaims) -> Result<(), RegistryError> {
        if self.negotiation.state().is_closed() {
            return Err(RegistryError::AssociationClosed(self.id()));
        }
        if self.claims.connection_mode != claims.connection_mode
            || self.claims.application_protocol != claims.application_protocol
        {
            return Err(RegistryError::AssociationConflict(self.id()));
        }
        Ok(())
    }

    fn admit(&mut self, candidate: &Candidate) -> Result<Admission, RegistryError> {
        let role = candidate.role();
        if matches!(self.claims.connection_mode, ConnectionMode::Forward { .. })
            && role == Role::Server
            && !candidate.is_dialed()
        {
            return Err(RegistryError::RoleNotAllowed(role));
        }

        let admission = self.negotiation.check_admission(role, candidate.id())?;
        self.candidates.push(CandidateRecord {
            id: candidate.id(),
            role,
            peer: candidate.peer().to_owned(),
            attached_at: Utc::now(),
        });
        self.negotiation.mark_present(role);
        if candidate.is_dialed() {
            self.negotiation.mark_dialed();
        }
        self.publish();
        Ok(admission)
    }

    /// Forget a candidate that was admitted but never claimed its slot
    fn withdraw(&mut self, candidate_id: Uuid, role: Role) {
        if let Some(pos) = self.candidates.iter().rposition(|record| record.id == candidate_id) {
            self.candidates.remove(pos);
        }
        self.negotiation.withdraw(role);
        self.publish();
    }

    fn info(&self) -> AssociationInfo {
        AssociationInfo {
            id: self.id(),
            application_protocol: self.claims.application_protocol.to_string(),
            connection_mode: self.claims.connection_mode.label(),
            state: self.negotiation.state().clone(),
            created_at: self.created_at,
            destination: self.destination.as_ref().map(ToString::to_string),
            candidates: self.candidates.clone(),
        }
    }
}

type AssociationEntry = Arc<Mutex<Association>>;

/// Caller's view of an open association
pub struct AssociationHandle {
    id: Uuid,
    state_rx: watch::Receiver<NegotiationState>,
    entry: AssociationEntry,
}

impl AssociationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> NegotiationState {
        self.state_rx.borrow().clone()
    }

    /// Wait until the state satisfies `pred`
    pub async fn wait_for_state(
        &mut self,
        pred: impl FnMut(&NegotiationState) -> bool,
    ) -> NegotiationState {
        let reached = self
            .state_rx
            .wait_for(pred)
            .await
            .map(|state| NegotiationState::clone(&state));
        // sender gone: report the last published state
        reached.unwrap_or_else(|_| self.state_rx.borrow().clone())
    }

    /// Target reached by the forward dial
    pub fn destination(&self) -> Option<TargetAddr> {
        self.entry.lock().destination.clone()
    }
}

pub struct AssociationRegistry {
    associations: DashMap<Uuid, AssociationEntry>,
    config: NegotiationConfig,
    forwarder: Forwarder,
    sessions: SessionManager,
    metrics: Arc<RelayMetrics>,
}

impl AssociationRegistry {
    pub fn new(
        config: NegotiationConfig,
        forwarder: Forwarder,
        sessions: SessionManager,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            associations: DashMap::new(),
            config,
            forwarder,
            sessions,
            metrics,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Open the association named by `claims`, or join the existing one.
    ///
    /// In forward mode the first `open` dials the destination and attaches
    /// the resulting socket as the server candidate.
    pub async fn open(self: &Arc<Self>, claims: AssociationClaims) -> Result<AssociationHandle, RegistryError> {
        let id = claims.association_id;
        let targets = claims.connection_mode.targets().to_vec();
        let forward = matches!(claims.connection_mode, ConnectionMode::Forward { .. });

        let (entry, created) = match self.associations.entry(id) {
            Entry::Occupied(occupied) => {
                let entry = Arc::clone(occupied.get());
                entry.lock().check_compatible(&claims)?;
                (entry, false)
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(Mutex::new(Association::new(claims)));
                vacant.insert(Arc::clone(&entry));
                (entry, true)
            }
        };

        let state_rx = entry.lock().state_tx.subscribe();
        let handle = AssociationHandle {
            id,
            state_rx: state_rx.clone(),
            entry: Arc::clone(&entry),
        };

        if !created {
            debug!(association_id = %id, "Joined existing association");
            return Ok(handle);
        }

        info!(association_id = %id, forward, "Association opened");
        self.metrics.record_association_opened();
        self.spawn_negotiation_timer(id, Arc::clone(&entry), state_rx);

        if forward {
            match dial(&targets, self.config.dial_timeout).await {
                Ok((stream, target)) => {
                    entry.lock().destination = Some(target.clone());
                    self.attach_to(id, &entry, Candidate::dialed(stream, &target)).await?;
                }
                Err(e) => {
                    self.close_entry(id, &entry, CloseReason::DialFailed);
                    return Err(e);
                }
            }
        }

        Ok(handle)
    }

    /// Offer a candidate socket to an open association
    pub async fn attach_candidate(self: &Arc<Self>, id: Uuid, candidate: Candidate) -> Result<(), RegistryError> {
        let Some(entry) = self.entry(id) else {
            let error = RegistryError::UnknownAssociation(id);
            let (status, reason) = error.status();
            candidate.reject(status, reason).await;
            return Err(error);
        };
        self.attach_to(id, &entry, candidate).await
    }

    async fn attach_to(
        self: &Arc<Self>,
        id: Uuid,
        entry: &AssociationEntry,
        mut candidate: Candidate,
    ) -> Result<(), RegistryError> {
        let role = candidate.role();
        let candidate_id = candidate.id();

        let admitted = {
            let mut association = entry.lock();
            association.admit(&candidate).map(|admission| {
                (
                    admission,
                    association.claims.connection_test,
                    association.cancel.clone(),
                )
            })
        };
        let (admission, connection_test, cancel) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(association_id = %id, candidate_id = %candidate_id, %role, error = %e, "Candidate rejected");
                let (status, reason) = e.status();
                candidate.reject(status, reason).await;
                return Err(e);
            }
        };

        if let Err(e) = candidate.acknowledge().await {
            entry.lock().withdraw(candidate_id, role);
            return Err(e.into());
        }
        debug!(association_id = %id, candidate_id = %candidate_id, %role, peer = candidate.peer(), "Candidate attached");

        let claim = match (admission, connection_test) {
            (Admission::Reserved, _) | (_, None) => Claim::Bind,
            _ if candidate.is_dialed() || !candidate.speaks_jet() => Claim::Bind,
            (Admission::Open, Some(test)) => {
                let tested = tokio::select! {
                    res = candidate.probe(id, self.config.connection_test_timeout) => {
                        res.map_err(|e| {
                            warn!(association_id = %id, candidate_id = %candidate_id, error = %e, "Connection test failed");
                            RegistryError::ConnectionTestFailed(e.to_string())
                        })
                    }
                    _ = cancel.cancelled() => Err(RegistryError::AssociationClosed(id)),
                };
                if let Err(e) = tested {
                    entry.lock().withdraw(candidate_id, role);
                    return Err(e);
                }
                match test {
                    ConnectionTest::Keep => Claim::Bind,
                    ConnectionTest::Close => Claim::Reserve,
                }
            }
        };

        let claimed = {
            let mut association = entry.lock();
            match association.negotiation.claim(role, candidate_id, claim) {
                Ok(ready) => {
                    if claim == Claim::Bind {
                        association.pending.insert(role, candidate.into_endpoint());
                    }
                    if ready {
                        association.negotiation.select();
                        association.publish();
                    }
                    Ok(ready)
                }
                Err(e) => {
                    association.withdraw(candidate_id, role);
                    Err(e)
                }
            }
        };
        let ready = match claimed {
            Ok(ready) => ready,
            Err(e) => {
                warn!(association_id = %id, candidate_id = %candidate_id, %role, error = %e, "Admitted candidate lost its slot");
                return Err(e);
            }
        };

        match claim {
            Claim::Reserve => {
                info!(association_id = %id, candidate_id = %candidate_id, %role, "Candidate tested, slot reserved")
            }
            Claim::Bind => {
                info!(association_id = %id, candidate_id = %candidate_id, %role, "Candidate bound")
            }
        }

        if ready {
            self.spawn_relay(id, Arc::clone(entry));
        }
        Ok(())
    }

    fn spawn_relay(self: &Arc<Self>, id: Uuid, entry: AssociationEntry) {
        let prepared = {
            let mut association = entry.lock();
            let client = association.pending.remove(&Role::Client);
            let server = association.pending.remove(&Role::Server);
            association.negotiation.start_relaying();
            association.publish();

            let claims = &association.claims;
            let policy = SessionPolicy {
                recording: claims.recording,
                filtering: claims.filtering,
            };
            let info = SessionInfo {
                association_id: id,
                application_protocol: claims.application_protocol.to_string(),
                connection_mode: claims.connection_mode.label(),
                destination: association.destination.as_ref().map(ToString::to_string),
                recording: claims.recording,
                filtering: claims.filtering,
                ttl_minutes: claims.session_ttl_minutes,
                started_at: Utc::now(),
                bytes_in: 0,
                bytes_out: 0,
                ended_at: None,
                termination_reason: None,
            };
            let context = (
                claims.application_protocol.clone(),
                claims.session_ttl(),
                association.cancel.clone(),
            );
            client.zip(server).map(|pair| (pair, policy, info, context))
        };

        let Some(((client, server), policy, info, (protocol, ttl, cancel))) = prepared else {
            warn!(association_id = %id, "Selected association is missing a socket");
            self.close_entry(id, &entry, CloseReason::Terminated);
            return;
        };

        self.metrics.record_session_started();
        let counters = self.sessions.start(info);
        let ctx = SessionContext {
            association_id: id,
            protocol,
            ttl,
            cancel,
            counters,
        };

        info!(association_id = %id, "Relay session started");
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let result = registry.forwarder.run(client, server, policy, ctx).await;
            registry.finish(id, &entry, result);
        });
    }

    fn finish(&self, id: Uuid, entry: &AssociationEntry, result: SessionResult) {
        self.metrics
            .record_session_finished(result.termination_reason, result.duration);
        self.sessions.finish(id, &result);
        self.close_entry(id, entry, CloseReason::SessionEnded(result.termination_reason));
    }

    fn spawn_negotiation_timer(
        self: &Arc<Self>,
        id: Uuid,
        entry: AssociationEntry,
        mut state_rx: watch::Receiver<NegotiationState>,
    ) {
        let registry = Arc::clone(self);
        let timeout = self.config.negotiation_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if registry.expire_negotiation(id, &entry) {
                        warn!(association_id = %id, timeout_secs = timeout.as_secs(), "Negotiation timed out");
                    }
                }
                _ = state_rx.wait_for(|state| {
                    matches!(state, NegotiationState::Relaying | NegotiationState::Closed { .. })
                }) => {}
            }
        });
    }

    /// Close the association unless a pair was selected in the meantime
    fn expire_negotiation(&self, id: Uuid, entry: &AssociationEntry) -> bool {
        self.close_entry_with(id, entry, CloseReason::NegotiationTimeout, Negotiation::close_if_negotiating)
    }

    fn close_entry(&self, id: Uuid, entry: &AssociationEntry, reason: CloseReason) -> bool {
        self.close_entry_with(id, entry, reason, Negotiation::close)
    }

    /// Apply `transition` under the association lock and release the entry if it closed
    fn close_entry_with(
        &self,
        id: Uuid,
        entry: &AssociationEntry,
        reason: CloseReason,
        transition: impl FnOnce(&mut Negotiation, CloseReason) -> bool,
    ) -> bool {
        let released = {
            let mut association = entry.lock();
            if !transition(&mut association.negotiation, reason.clone()) {
                return false;
            }
            association.cancel.cancel();
            association.publish();
            std::mem::take(&mut association.pending)
        };
        drop(released);

        // only remove this instance; the id may have been reopened
        self.associations
            .remove_if(&id, |_, current| Arc::ptr_eq(current, entry));

        self.metrics.record_association_closed();
        if !matches!(reason, CloseReason::SessionEnded(_)) {
            self.metrics.record_negotiation_failure(reason.as_str());
        }
        info!(association_id = %id, reason = ?reason, "Association closed");
        true
    }

    /// Close an association, releasing any attached sockets
    pub fn close(&self, id: Uuid, reason: CloseReason) -> Result<(), RegistryError> {
        let entry = self.entry(id).ok_or(RegistryError::UnknownAssociation(id))?;
        self.close_entry(id, &entry, reason);
        Ok(())
    }

    /// Stop a relaying session or abort a negotiation
    pub fn terminate(&self, id: Uuid) -> Result<(), RegistryError> {
        let entry = self.entry(id).ok_or(RegistryError::UnknownAssociation(id))?;
        let relaying = {
            let association = entry.lock();
            let relaying = *association.negotiation.state() == NegotiationState::Relaying;
            if relaying {
                association.cancel.cancel();
            }
            relaying
        };

        if relaying {
            info!(association_id = %id, "Relay session termination requested");
        } else {
            self.close_entry(id, &entry, CloseReason::Terminated);
        }
        Ok(())
    }

    /// Terminate every association, used on shutdown
    pub fn terminate_all(&self) {
        let ids: Vec<Uuid> = self.associations.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            let _ = self.terminate(id);
        }
    }

    fn entry(&self, id: Uuid) -> Option<AssociationEntry> {
        self.associations.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get(&self, id: Uuid) -> Option<AssociationInfo> {
        self.entry(id).map(|entry| entry.lock().info())
    }

    pub fn list(&self) -> Vec<AssociationInfo> {
        let entries: Vec<AssociationEntry> = self
            .associations
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut infos: Vec<AssociationInfo> = entries.iter().map(|entry| entry.lock().info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn count(&self) -> usize {
        self.associations.len()
    }
}

/// Connect to the first reachable target, in order
async fn dial(targets: &[TargetAddr], timeout: Duration) -> Result<(TcpStream, TargetAddr), RegistryError> {
    let mut failures = Vec::with_capacity(targets.len());
    for target in targets {
        match tokio::time::timeout(timeout, TcpStream::connect(target.authority())).await {
            Ok(Ok(stream)) => {
                info!(%target, "Connected to destination");
                return Ok((stream, target.clone()));
            }
            Ok(Err(e)) => {
                warn!(%target, error = %e, "Destination unreachable");
                failures.push(format!("{target}: {e}"));
            }
            Err(_) => {
                warn!(%target, timeout_secs = timeout.as_secs(), "Destination connect timed out");
                failures.push(format!("{target}: timed out"));
            }
        }
    }
    Err(RegistryError::DialFailed(failures.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::TerminationReason;
    use crate::jet;
    use bytes::BytesMut;
    use jet_token::ApplicationProtocol;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    fn registry(config: NegotiationConfig) -> Arc<AssociationRegistry> {
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        Arc::new(AssociationRegistry::new(
            config,
            Forwarder::new(None, Arc::clone(&metrics)),
            SessionManager::new(16),
            metrics,
        ))
    }

    fn claims(id: Uuid, mode: ConnectionMode) -> AssociationClaims {
        AssociationClaims {
            jti: Uuid::new_v4(),
            exp: 0,
            association_id: id,
            application_protocol: ApplicationProtocol::unknown(),
            connection_mode: mode,
            recording: false,
            filtering: false,
            connection_test: None,
            session_ttl_minutes: None,
            credentials: None,
        }
    }

    fn candidate(role: Role) -> (Candidate, DuplexStream) {
        let (relay_side, peer_side) = duplex(4096);
        (Candidate::new(role, relay_side, "test").with_jet_greeting(2), peer_side)
    }

    async fn read_status(peer: &mut DuplexStream) -> Option<u16> {
        let (head, _) = jet::read_head(peer, BytesMut::new(), jet::MAX_HEAD_LEN).await.ok()?;
        jet::parse_status(&head)
    }

    async fn unreachable_target() -> TargetAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        TargetAddr::parse(&addr.to_string(), None).unwrap()
    }

    #[tokio::test]
    async fn test_rendezvous_selects_and_rejects_late_client() {
        let registry = registry(NegotiationConfig::default());
        let id = Uuid::new_v4();
        let mut handle = registry.open(claims(id, ConnectionMode::Rendezvous)).await.unwrap();

        let (client, mut client_peer) = candidate(Role::Client);
        let (server, mut server_peer) = candidate(Role::Server);
        registry.attach_candidate(id, client).await.unwrap();
        registry.attach_candidate(id, server).await.unwrap();
        assert_eq!(read_status(&mut client_peer).await, Some(200));
        assert_eq!(read_status(&mut server_peer).await, Some(200));

        let state = handle
            .wait_for_state(|s| *s == NegotiationState::Relaying)
            .await;
        assert_eq!(state, NegotiationState::Relaying);

        let (late, mut late_peer) = candidate(Role::Client);
        assert!(matches!(
            registry.attach_candidate(id, late).await,
            Err(RegistryError::RoleAlreadyFilled(Role::Client))
        ));
        assert_eq!(read_status(&mut late_peer).await, Some(409));

        // the original pair still relays
        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(registry.sessions().count(), 1);

        drop(client_peer);
        drop(server_peer);
        let state = handle.wait_for_state(NegotiationState::is_closed).await;
        assert!(matches!(
            state,
            NegotiationState::Closed {
                reason: CloseReason::SessionEnded(_)
            }
        ));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_open_conflicts_and_unknown() {
        let registry = registry(NegotiationConfig::default());
        let id = Uuid::new_v4();
        registry.open(claims(id, ConnectionMode::Rendezvous)).await.unwrap();
        // same parameters join
        registry.open(claims(id, ConnectionMode::Rendezvous)).await.unwrap();

        let mut other = claims(id, ConnectionMode::Rendezvous);
        other.application_protocol = ApplicationProtocol::new("ssh");
        assert!(matches!(
            registry.open(other).await,
            Err(RegistryError::AssociationConflict(_))
        ));
        assert_eq!(registry.count(), 1);

        let (unknown, mut peer) = candidate(Role::Client);
        assert!(matches!(
            registry.attach_candidate(Uuid::new_v4(), unknown).await,
            Err(RegistryError::UnknownAssociation(_))
        ));
        assert_eq!(read_status(&mut peer).await, Some(404));
    }

    #[tokio::test]
    async fn test_forward_failover_relays_to_reachable_target() {
        let registry = registry(NegotiationConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reachable = TargetAddr::parse(&listener.local_addr().unwrap().to_string(), None).unwrap();
        let targets = vec![unreachable_target().await, reachable.clone()];

        let id = Uuid::new_v4();
        let mut handle = registry
            .open(claims(id, ConnectionMode::Forward { targets }))
            .await
            .unwrap();
        assert_eq!(handle.destination(), Some(reachable));
        let (mut destination, _) = listener.accept().await.unwrap();

        // an external server is not allowed in forward mode
        let (server, _server_peer) = candidate(Role::Server);
        assert!(matches!(
            registry.attach_candidate(id, server).await,
            Err(RegistryError::RoleNotAllowed(Role::Server))
        ));

        let (client, mut client_peer) = candidate(Role::Client);
        registry.attach_candidate(id, client).await.unwrap();
        assert_eq!(read_status(&mut client_peer).await, Some(200));
        handle.wait_for_state(|s| *s == NegotiationState::Relaying).await;

        client_peer.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        destination.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn test_forward_dial_failure_closes() {
        let registry = registry(NegotiationConfig::default());
        let id = Uuid::new_v4();
        let targets = vec![unreachable_target().await];
        assert!(matches!(
            registry.open(claims(id, ConnectionMode::Forward { targets })).await,
            Err(RegistryError::DialFailed(_))
        ));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_negotiation_timeout_releases_half_attached() {
        let registry = registry(NegotiationConfig {
            negotiation_timeout: Duration::from_millis(50),
            ..NegotiationConfig::default()
        });
        let id = Uuid::new_v4();
        let mut handle = registry.open(claims(id, ConnectionMode::Rendezvous)).await.unwrap();

        let (client, mut client_peer) = candidate(Role::Client);
        registry.attach_candidate(id, client).await.unwrap();
        assert_eq!(read_status(&mut client_peer).await, Some(200));

        let state = handle.wait_for_state(NegotiationState::is_closed).await;
        assert_eq!(
            state,
            NegotiationState::Closed {
                reason: CloseReason::NegotiationTimeout
            }
        );
        assert_eq!(registry.count(), 0);

        // the pending socket was released
        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_connection_test_close_reserves_slot() {
        let registry = registry(NegotiationConfig::default());
        let id = Uuid::new_v4();
        let mut association = claims(id, ConnectionMode::Rendezvous);
        association.connection_test = Some(ConnectionTest::Close);
        registry.open(association).await.unwrap();

        let (server, mut server_peer) = candidate(Role::Server);
        let server_id = server.id();
        let peer = tokio::spawn(async move {
            let (head, rest) = jet::read_head(&mut server_peer, BytesMut::new(), jet::MAX_HEAD_LEN)
                .await
                .unwrap();
            assert_eq!(jet::parse_status(&head), Some(200));
            let (head, _) = jet::read_head(&mut server_peer, BytesMut::from(&rest[..]), jet::MAX_HEAD_LEN)
                .await
                .unwrap();
            assert!(head.starts_with(b"GET /jet/test/"));
            server_peer.write_all(jet::response(2, 200, "OK").as_bytes()).await.unwrap();
            server_peer
        });
        registry.attach_candidate(id, server).await.unwrap();
        let _ = peer.await.unwrap();

        // a different server candidate cannot take the reserved slot
        let (intruder, _intruder_peer) = candidate(Role::Server);
        assert!(matches!(
            registry.attach_candidate(id, intruder).await,
            Err(RegistryError::RoleAlreadyFilled(Role::Server))
        ));

        // the tested candidate reconnects and binds without a new test
        let (again, mut again_peer) = candidate(Role::Server);
        registry.attach_candidate(id, again.with_id(server_id)).await.unwrap();
        assert_eq!(read_status(&mut again_peer).await, Some(200));
        let info = registry.get(id).unwrap();
        assert_eq!(info.candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_terminate_relaying_session() {
        let registry = registry(NegotiationConfig::default());
        let id = Uuid::new_v4();
        let mut handle = registry.open(claims(id, ConnectionMode::Rendezvous)).await.unwrap();
        let (client, _client_peer) = candidate(Role::Client);
        let (server, _server_peer) = candidate(Role::Server);
        registry.attach_candidate(id, client).await.unwrap();
        registry.attach_candidate(id, server).await.unwrap();
        handle.wait_for_state(|s| *s == NegotiationState::Relaying).await;

        registry.terminate(id).unwrap();
        let state = handle.wait_for_state(NegotiationState::is_closed).await;
        assert_eq!(
            state,
            NegotiationState::Closed {
                reason: CloseReason::SessionEnded(TerminationReason::Cancelled)
            }
        );
        assert_eq!(
            registry.sessions().recent()[0].termination_reason,
            Some(TerminationReason::Cancelled)
        );
        assert!(matches!(registry.terminate(id), Err(RegistryError::UnknownAssociation(_))));
    }

    #[tokio::test]
    async fn test_expired_timer_spares_relaying_session() {
        let registry = registry(NegotiationConfig::default());
        let id = Uuid::new_v4();
        let mut handle = registry.open(claims(id, ConnectionMode::Rendezvous)).await.unwrap();
        let (client, mut client_peer) = candidate(Role::Client);
        let (server, mut server_peer) = candidate(Role::Server);
        registry.attach_candidate(id, client).await.unwrap();
        registry.attach_candidate(id, server).await.unwrap();
        assert_eq!(read_status(&mut client_peer).await, Some(200));
        assert_eq!(read_status(&mut server_peer).await, Some(200));
        handle.wait_for_state(|s| *s == NegotiationState::Relaying).await;

        // the timer fired but lost the lock to the selection
        let entry = registry.entry(id).unwrap();
        assert!(!registry.expire_negotiation(id, &entry));
        assert_eq!(handle.state(), NegotiationState::Relaying);
        assert_eq!(registry.count(), 1);

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_raw_candidates_skip_connection_test() {
        let registry = registry(NegotiationConfig::default());
        let id = Uuid::new_v4();
        let mut association = claims(id, ConnectionMode::Rendezvous);
        association.connection_test = Some(ConnectionTest::Keep);
        let mut handle = registry.open(association).await.unwrap();

        let (client_side, mut client_peer) = duplex(4096);
        let (server_side, mut server_peer) = duplex(4096);
        registry
            .attach_candidate(id, Candidate::new(Role::Client, client_side, "pcb-client"))
            .await
            .unwrap();
        registry
            .attach_candidate(id, Candidate::new(Role::Server, server_side, "pcb-server"))
            .await
            .unwrap();
        handle.wait_for_state(|s| *s == NegotiationState::Relaying).await;

        // nothing but relayed bytes reach a raw peer
        client_peer.write_all(b"\x03\x00").await.unwrap();
        let mut buf = [0u8; 2];
        server_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x03\x00");
    }

    #[tokio::test]
    async fn test_failed_connection_test_withdraws_candidate() {
        let registry = registry(NegotiationConfig {
            connection_test_timeout: Duration::from_millis(50),
            ..NegotiationConfig::default()
        });
        let id = Uuid::new_v4();
        let mut association = claims(id, ConnectionMode::Rendezvous);
        association.connection_test = Some(ConnectionTest::Keep);
        registry.open(association).await.unwrap();

        let (server, mut server_peer) = candidate(Role::Server);
        let server_peer = tokio::spawn(async move {
            let (head, rest) = jet::read_head(&mut server_peer, BytesMut::new(), jet::MAX_HEAD_LEN)
                .await
                .unwrap();
            assert_eq!(jet::parse_status(&head), Some(200));
            let (head, _) = jet::read_head(&mut server_peer, BytesMut::from(&rest[..]), jet::MAX_HEAD_LEN)
                .await
                .unwrap();
            assert!(head.starts_with(b"GET /jet/test/"));
            server_peer.write_all(jet::response(2, 200, "OK").as_bytes()).await.unwrap();
            server_peer
        });
        registry.attach_candidate(id, server).await.unwrap();
        let _server_peer = server_peer.await.unwrap();

        // this client never answers its test
        let (client, _client_peer) = candidate(Role::Client);
        assert!(matches!(
            registry.attach_candidate(id, client).await,
            Err(RegistryError::ConnectionTestFailed(_))
        ));

        let info = registry.get(id).unwrap();
        assert_eq!(info.state, NegotiationState::AwaitingCandidates);
        assert_eq!(info.candidates.len(), 1);
        assert_eq!(info.candidates[0].role, Role::Server);
    }

    /// Read the admission status and the connection test request
    async fn await_test(peer: &mut DuplexStream) {
        let (head, rest) = jet::read_head(peer, BytesMut::new(), jet::MAX_HEAD_LEN).await.unwrap();
        assert_eq!(jet::parse_status(&head), Some(200));
        let (head, _) = jet::read_head(peer, BytesMut::from(&rest[..]), jet::MAX_HEAD_LEN)
            .await
            .unwrap();
        assert!(head.starts_with(b"GET /jet/test/"));
    }

    #[tokio::test]
    async fn test_candidate_losing_the_claim_is_withdrawn() {
        let registry = registry(NegotiationConfig::default());
        let id = Uuid::new_v4();
        let mut association = claims(id, ConnectionMode::Rendezvous);
        association.connection_test = Some(ConnectionTest::Keep);
        registry.open(association).await.unwrap();

        // both servers are admitted while the slot is still empty
        let (slow, mut slow_peer) = candidate(Role::Server);
        let slow_attach = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.attach_candidate(id, slow).await }
        });
        await_test(&mut slow_peer).await;

        let (fast, mut fast_peer) = candidate(Role::Server);
        let fast_id = fast.id();
        let fast_peer = tokio::spawn(async move {
            await_test(&mut fast_peer).await;
            fast_peer.write_all(jet::response(2, 200, "OK").as_bytes()).await.unwrap();
            fast_peer
        });
        registry.attach_candidate(id, fast).await.unwrap();
        let _fast_peer = fast_peer.await.unwrap();

        slow_peer.write_all(jet::response(2, 200, "OK").as_bytes()).await.unwrap();
        assert!(matches!(
            slow_attach.await.unwrap(),
            Err(RegistryError::RoleAlreadyFilled(Role::Server))
        ));

        let info = registry.get(id).unwrap();
        assert_eq!(info.candidates.len(), 1);
        assert_eq!(info.candidates[0].id, fast_id);
        assert_eq!(info.state, NegotiationState::AwaitingCandidates);
    }
}
