//! WebSocket to byte stream adapter

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Expose a WebSocket as a byte stream.
///
/// Binary and text frames are concatenated; writes become binary frames.
/// The pump task ends when either side closes.
pub fn into_stream(socket: WebSocket) -> DuplexStream {
    let (stream, mut pipe) = tokio::io::duplex(PIPE_CAPACITY);

    tokio::spawn(async move {
        let (mut sink, mut source) = socket.split();
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            tokio::select! {
                message = source.next() => {
                    let payload = match message {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(error = %e, "WebSocket read failed");
                            break;
                        }
                    };
                    if pipe.write_all(&payload).await.is_err() {
                        break;
                    }
                }
                read = pipe.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                        Ok(n) => {
                            if sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        let _ = pipe.shutdown().await;
    });

    stream
}
