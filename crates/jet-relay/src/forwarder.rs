//! Full-duplex relay between the selected client and server sockets

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use jet_token::ApplicationProtocol;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::candidate::Endpoint;
use crate::filter::{FilterViolation, ProtocolFilter};
use crate::metrics::RelayMetrics;
use crate::recording::{FileRecordingSink, RecordingSink};
use crate::session::SessionCounters;

const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::ClientToServer, Direction::ServerToClient];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }

    /// Tag used in recording frames
    pub fn as_u8(&self) -> u8 {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ClientClosed,
    ServerClosed,
    IoError,
    RecordingFailed,
    ProtocolPolicyViolation,
    TtlExpired,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::ClientClosed => "client_closed",
            TerminationReason::ServerClosed => "server_closed",
            TerminationReason::IoError => "io_error",
            TerminationReason::RecordingFailed => "recording_failed",
            TerminationReason::ProtocolPolicyViolation => "protocol_policy_violation",
            TerminationReason::TtlExpired => "ttl_expired",
            TerminationReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPolicy {
    pub recording: bool,
    pub filtering: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    /// Bytes received from the client
    pub bytes_in: u64,
    /// Bytes received from the server
    pub bytes_out: u64,
    pub duration: Duration,
    pub termination_reason: TerminationReason,
}

pub struct SessionContext {
    pub association_id: Uuid,
    pub protocol: ApplicationProtocol,
    pub ttl: Option<Duration>,
    pub cancel: CancellationToken,
    pub counters: Arc<SessionCounters>,
}

#[derive(Debug, Error)]
enum PumpError {
    #[error("read failed: {0}")]
    Read(std::io::Error),
    #[error("write failed: {0}")]
    Write(std::io::Error),
    #[error("recording failed: {0}")]
    Recording(std::io::Error),
    #[error(transparent)]
    Policy(#[from] FilterViolation),
}

impl PumpError {
    fn reason(&self) -> TerminationReason {
        match self {
            PumpError::Read(_) | PumpError::Write(_) => TerminationReason::IoError,
            PumpError::Recording(_) => TerminationReason::RecordingFailed,
            PumpError::Policy(_) => TerminationReason::ProtocolPolicyViolation,
        }
    }
}

/// Side effects applied to each chunk before it is forwarded
struct Tap<'a> {
    sink: Option<&'a tokio::sync::Mutex<Box<dyn RecordingSink>>>,
    filter: Option<&'a parking_lot::Mutex<ProtocolFilter>>,
    counters: &'a SessionCounters,
    metrics: &'a RelayMetrics,
}

impl Tap<'_> {
    async fn observe(&self, direction: Direction, data: &[u8]) -> Result<(), PumpError> {
        if let Some(filter) = self.filter {
            filter.lock().inspect(direction, data)?;
        }
        if let Some(sink) = self.sink {
            sink.lock()
                .await
                .record(direction, data)
                .await
                .map_err(PumpError::Recording)?;
        }
        Ok(())
    }

    fn forwarded(&self, direction: Direction, bytes: usize) {
        self.counters.add(direction, bytes);
        self.metrics.record_forward(direction, bytes);
    }
}

#[derive(Clone)]
pub struct Forwarder {
    recording_dir: Option<PathBuf>,
    metrics: Arc<RelayMetrics>,
}

impl Forwarder {
    pub fn new(recording_dir: Option<PathBuf>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            recording_dir,
            metrics,
        }
    }

    /// Relay until both directions finish, an error, cancellation or TTL
    pub async fn run(
        &self,
        client: Endpoint,
        server: Endpoint,
        policy: SessionPolicy,
        ctx: SessionContext,
    ) -> SessionResult {
        let started = Instant::now();

        let sink: Option<Box<dyn RecordingSink>> = if policy.recording {
            let Some(dir) = &self.recording_dir else {
                error!(association_id = %ctx.association_id, "Recording required but no recording directory is configured");
                return result(&ctx, started, TerminationReason::RecordingFailed);
            };
            match FileRecordingSink::create(dir, ctx.association_id).await {
                Ok(sink) => {
                    info!(association_id = %ctx.association_id, path = %sink.path().display(), "Recording session");
                    Some(Box::new(sink))
                }
                Err(e) => {
                    error!(association_id = %ctx.association_id, error = %e, "Failed to open recording");
                    return result(&ctx, started, TerminationReason::RecordingFailed);
                }
            }
        } else {
            None
        };

        let filter = if policy.filtering {
            ProtocolFilter::for_protocol(&ctx.protocol)
        } else {
            None
        };

        self.relay(client, server, sink, filter, ctx, started).await
    }

    async fn relay(
        &self,
        client: Endpoint,
        server: Endpoint,
        sink: Option<Box<dyn RecordingSink>>,
        filter: Option<ProtocolFilter>,
        ctx: SessionContext,
        started: Instant,
    ) -> SessionResult {
        let sink = sink.map(tokio::sync::Mutex::new);
        let filter = filter.map(parking_lot::Mutex::new);

        let (client_read, client_write) = tokio::io::split(client.transport);
        let (server_read, server_write) = tokio::io::split(server.transport);

        let mut reason = {
            let tap = Tap {
                sink: sink.as_ref(),
                filter: filter.as_ref(),
                counters: &ctx.counters,
                metrics: &self.metrics,
            };

            let c2s = pump(Direction::ClientToServer, client.leftover, client_read, server_write, &tap);
            let s2c = pump(Direction::ServerToClient, server.leftover, server_read, client_write, &tap);
            let ttl = async {
                match ctx.ttl {
                    Some(ttl) => tokio::time::sleep(ttl).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(c2s, s2c, ttl);

            let mut first_eof = None;
            let (mut c2s_done, mut s2c_done) = (false, false);

            // pumps and socket halves drop at the end of this block
            loop {
                tokio::select! {
                    res = &mut c2s, if !c2s_done => {
                        c2s_done = true;
                        match res {
                            Ok(()) => { first_eof.get_or_insert(Direction::ClientToServer); }
                            Err(e) => break log_pump_error(&ctx, Direction::ClientToServer, e),
                        }
                    }
                    res = &mut s2c, if !s2c_done => {
                        s2c_done = true;
                        match res {
                            Ok(()) => { first_eof.get_or_insert(Direction::ServerToClient); }
                            Err(e) => break log_pump_error(&ctx, Direction::ServerToClient, e),
                        }
                    }
                    _ = ctx.cancel.cancelled() => break TerminationReason::Cancelled,
                    _ = &mut ttl => break TerminationReason::TtlExpired,
                }

                if c2s_done && s2c_done {
                    break match first_eof {
                        Some(Direction::ServerToClient) => TerminationReason::ServerClosed,
                        _ => TerminationReason::ClientClosed,
                    };
                }
            }
        };

        if let Some(sink) = sink {
            if let Err(e) = sink.into_inner().finish().await {
                error!(association_id = %ctx.association_id, error = %e, "Failed to finalize recording");
                reason = TerminationReason::RecordingFailed;
            }
        }

        let result = result(&ctx, started, reason);
        info!(
            association_id = %ctx.association_id,
            reason = reason.as_str(),
            bytes_in = result.bytes_in,
            bytes_out = result.bytes_out,
            duration_ms = result.duration.as_millis() as u64,
            "Relay session ended"
        );
        result
    }
}

fn result(ctx: &SessionContext, started: Instant, reason: TerminationReason) -> SessionResult {
    SessionResult {
        bytes_in: ctx.counters.bytes_in(),
        bytes_out: ctx.counters.bytes_out(),
        duration: started.elapsed(),
        termination_reason: reason,
    }
}

fn log_pump_error(ctx: &SessionContext, direction: Direction, error: PumpError) -> TerminationReason {
    warn!(association_id = %ctx.association_id, %direction, %error, "Relay direction failed");
    error.reason()
}

async fn pump<R, W>(
    direction: Direction,
    leftover: Bytes,
    mut reader: R,
    mut writer: W,
    tap: &Tap<'_>,
) -> Result<(), PumpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !leftover.is_empty() {
        tap.observe(direction, &leftover).await?;
        writer.write_all(&leftover).await.map_err(PumpError::Write)?;
        writer.flush().await.map_err(PumpError::Write)?;
        tap.forwarded(direction, leftover.len());
    }

    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await.map_err(PumpError::Read)?;
        if n == 0 {
            // half-close: the peer sees EOF while the other direction keeps going
            let _ = writer.shutdown().await;
            return Ok(());
        }

        tap.observe(direction, &buf[..n]).await?;
        writer.write_all(&buf[..n]).await.map_err(PumpError::Write)?;
        writer.flush().await.map_err(PumpError::Write)?;
        tap.forwarded(direction, n);
    }
}
