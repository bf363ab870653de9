//! Opening-bytes check of the claimed application protocol

use jet_token::ApplicationProtocol;
use thiserror::Error;

use crate::forwarder::Direction;

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT ", b"TRACE ",
];

#[derive(Debug, Error)]
#[error("Traffic does not look like {protocol} ({direction})")]
pub struct FilterViolation {
    pub protocol: String,
    pub direction: Direction,
}

/// Which direction carries the protocol's opening bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opening {
    Client,
    Server,
    FirstSpeaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    NeedMore,
    Match,
    Mismatch,
}

fn prefix(expected: &[u8], seen: &[u8]) -> Check {
    let n = expected.len().min(seen.len());
    if expected[..n] != seen[..n] {
        Check::Mismatch
    } else if n < expected.len() {
        Check::NeedMore
    } else {
        Check::Match
    }
}

fn http_method(seen: &[u8]) -> Check {
    let checks = HTTP_METHODS.map(|method| prefix(method, seen));
    if checks.contains(&Check::Match) {
        Check::Match
    } else if checks.contains(&Check::NeedMore) {
        Check::NeedMore
    } else {
        Check::Mismatch
    }
}

fn tpkt(seen: &[u8]) -> Check {
    prefix(&[0x03, 0x00], seen)
}

fn ssh_banner(seen: &[u8]) -> Check {
    prefix(b"SSH-", seen)
}

fn rfb_banner(seen: &[u8]) -> Check {
    prefix(b"RFB ", seen)
}

fn tls_handshake(seen: &[u8]) -> Check {
    prefix(&[0x16, 0x03], seen)
}

pub struct ProtocolFilter {
    protocol: ApplicationProtocol,
    opening: Opening,
    check: fn(&[u8]) -> Check,
    inspected: Option<Direction>,
    seen: Vec<u8>,
    done: bool,
}

impl ProtocolFilter {
    /// Filter for `protocol`, or `None` when it is not inspected
    pub fn for_protocol(protocol: &ApplicationProtocol) -> Option<Self> {
        let (opening, check): (Opening, fn(&[u8]) -> Check) = match protocol.as_str() {
            "rdp" => (Opening::Client, tpkt),
            "ssh" | "sftp" | "scp" => (Opening::FirstSpeaker, ssh_banner),
            "vnc" => (Opening::Server, rfb_banner),
            "http" => (Opening::Client, http_method),
            "https" | "ldaps" | "winrm-https" => (Opening::Client, tls_handshake),
            _ => return None,
        };

        Some(Self {
            protocol: protocol.clone(),
            opening,
            check,
            inspected: None,
            seen: Vec::new(),
            done: false,
        })
    }

    /// Inspect a chunk about to be forwarded
    pub fn inspect(&mut self, direction: Direction, data: &[u8]) -> Result<(), FilterViolation> {
        if self.done || data.is_empty() {
            return Ok(());
        }

        let inspected = *self.inspected.get_or_insert(match self.opening {
            Opening::Client => Direction::ClientToServer,
            Opening::Server => Direction::ServerToClient,
            Opening::FirstSpeaker => direction,
        });
        if inspected != direction {
            return Ok(());
        }

        self.seen.extend_from_slice(&data[..data.len().min(16)]);
        match (self.check)(&self.seen) {
            Check::NeedMore => Ok(()),
            Check::Match => {
                self.done = true;
                self.seen = Vec::new();
                Ok(())
            }
            Check::Mismatch => {
                self.done = true;
                Err(FilterViolation {
                    protocol: self.protocol.to_string(),
                    direction,
                })
            }
        }
    }
}
