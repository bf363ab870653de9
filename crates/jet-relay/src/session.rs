//! Live and recently ended relay sessions

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::forwarder::{Direction, SessionResult, TerminationReason};

/// Byte counters updated by the relay pumps while the session runs
#[derive(Debug, Default)]
pub struct SessionCounters {
    client_to_server: AtomicU64,
    server_to_client: AtomicU64,
}

impl SessionCounters {
    pub fn add(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes received from the client
    pub fn bytes_in(&self) -> u64 {
        self.client_to_server.load(Ordering::Relaxed)
    }

    /// Bytes received from the server
    pub fn bytes_out(&self) -> u64 {
        self.server_to_client.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub association_id: Uuid,
    pub application_protocol: String,
    pub connection_mode: &'static str,
    pub destination: Option<String>,
    pub recording: bool,
    pub filtering: bool,
    pub ttl_minutes: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
}

struct LiveSession {
    info: SessionInfo,
    counters: Arc<SessionCounters>,
}

/// Session table exposed by the management API
#[derive(Clone)]
pub struct SessionManager {
    live: Arc<DashMap<Uuid, LiveSession>>,
    recent: Arc<Mutex<VecDeque<SessionInfo>>>,
    history: usize,
}

impl SessionManager {
    pub fn new(history: usize) -> Self {
        Self {
            live: Arc::new(DashMap::new()),
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(history))),
            history,
        }
    }

    /// Register a session and get the counters its pumps update
    pub fn start(&self, info: SessionInfo) -> Arc<SessionCounters> {
        let counters = Arc::new(SessionCounters::default());
        self.live.insert(
            info.association_id,
            LiveSession {
                info,
                counters: Arc::clone(&counters),
            },
        );
        counters
    }

    pub fn finish(&self, association_id: Uuid, result: &SessionResult) {
        let Some((_, session)) = self.live.remove(&association_id) else {
            return;
        };

        let mut info = session.info;
        info.bytes_in = result.bytes_in;
        info.bytes_out = result.bytes_out;
        info.ended_at = Some(Utc::now());
        info.termination_reason = Some(result.termination_reason);

        if self.history == 0 {
            return;
        }
        let mut recent = self.recent.lock();
        if recent.len() == self.history {
            recent.pop_front();
        }
        recent.push_back(info);
    }

    /// Live sessions with current byte counts
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .live
            .iter()
            .map(|entry| {
                let mut info = entry.info.clone();
                info.bytes_in = entry.counters.bytes_in();
                info.bytes_out = entry.counters.bytes_out();
                info
            })
            .collect();
        sessions.sort_by_key(|info| info.started_at);
        sessions
    }

    /// Ended sessions, oldest first
    pub fn recent(&self) -> Vec<SessionInfo> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn get(&self, association_id: Uuid) -> Option<SessionInfo> {
        self.live.get(&association_id).map(|entry| entry.info.clone())
    }

    pub fn count(&self) -> usize {
        self.live.len()
    }
}
