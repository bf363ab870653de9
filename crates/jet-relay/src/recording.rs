//! Session recording sinks

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::forwarder::Direction;

pub const RECORDING_FILE_NAME: &str = "recording.jrec";

/// Receives a copy of every relayed chunk
#[async_trait]
pub trait RecordingSink: Send {
    async fn record(&mut self, direction: Direction, data: &[u8]) -> std::io::Result<()>;

    async fn finish(&mut self) -> std::io::Result<()>;
}

/// Writes `[direction u8][elapsed_ms u64 BE][len u32 BE][bytes]` frames
pub struct FileRecordingSink {
    path: PathBuf,
    writer: BufWriter<File>,
    started: Instant,
}

impl FileRecordingSink {
    /// Create `<dir>/<association_id>/recording.jrec`
    pub async fn create(dir: &Path, association_id: Uuid) -> std::io::Result<Self> {
        let session_dir = dir.join(association_id.to_string());
        tokio::fs::create_dir_all(&session_dir).await?;
        let path = session_dir.join(RECORDING_FILE_NAME);
        let file = File::create(&path).await?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            started: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn encode_frame(direction: Direction, elapsed_ms: u64, data: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(1 + 8 + 4 + data.len());
    frame.put_u8(direction.as_u8());
    frame.put_u64(elapsed_ms);
    frame.put_u32(data.len() as u32);
    frame.put_slice(data);
    frame
}

#[async_trait]
impl RecordingSink for FileRecordingSink {
    async fn record(&mut self, direction: Direction, data: &[u8]) -> std::io::Result<()> {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let frame = encode_frame(direction, elapsed_ms, data);
        self.writer.write_all(&frame).await
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await
    }
}
