//! A single transfer session: one connection carrying one file.
//!
//! The session owns the connection and a fixed-capacity chunk buffer. The
//! file handle stays with the caller, which opens it right before streaming
//! and drops it when the session returns.

use crate::config::{Framing, TransferConfig};
use crate::error::{Result, TransferError};
use crate::protocol::{self, ParseResult, Record, SENTINEL};
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// How a receive ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The end-of-transfer marker arrived.
    Completed,
    /// The stream ended without a marker; the destination is truncated.
    PeerClosed,
}

/// Result of a receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    /// Bytes written to the destination.
    pub bytes: u64,
    pub outcome: TransferOutcome,
}

pub struct Session<S> {
    stream: S,
    buffer: Vec<u8>,
    transferred: u64,
    framing: Framing,
    timeout: Option<Duration>,
}

impl<S> Session<S> {
    pub fn new(stream: S, config: &TransferConfig) -> Self {
        // The sentinel is only recognised when one read returns all of it.
        let capacity = match config.framing {
            Framing::Sentinel => config.buffer_size.max(SENTINEL.len()),
            Framing::Framed => config.buffer_size,
        };
        Self {
            stream,
            buffer: vec![0u8; capacity],
            transferred: 0,
            framing: config.framing,
            timeout: config.timeout,
        }
    }

    /// Payload bytes moved so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

impl<S: AsyncWrite + Unpin> Session<S> {
    /// Stream `source` to the peer, then send the end marker and shut down
    /// the write half.
    ///
    /// Every chunk is written in full. Returns the payload byte count.
    pub async fn send_from<R: AsyncRead + Unpin>(&mut self, source: &mut R) -> Result<u64> {
        let limit = self.timeout;
        let mut frame = BytesMut::new();

        loop {
            let n = read_retrying(source, &mut self.buffer)
                .await
                .map_err(|e| TransferError::Io("read source file", e))?;
            if n == 0 {
                break;
            }

            let chunk = &self.buffer[..n];
            match self.framing {
                Framing::Sentinel => {
                    deadline(limit, "write to connection", self.stream.write_all(chunk)).await?
                }
                Framing::Framed => {
                    frame.clear();
                    protocol::encode_data(chunk, &mut frame);
                    deadline(limit, "write to connection", self.stream.write_all(&frame)).await?
                }
            }

            self.transferred += n as u64;
            trace!(bytes = n, total = self.transferred, "Sent chunk");
        }

        match self.framing {
            Framing::Sentinel => {
                deadline(limit, "write end marker", self.stream.write_all(SENTINEL)).await?
            }
            Framing::Framed => {
                frame.clear();
                protocol::encode_end(self.transferred, &mut frame);
                deadline(limit, "write end marker", self.stream.write_all(&frame)).await?
            }
        }
        deadline(limit, "flush connection", self.stream.flush()).await?;
        deadline(limit, "shut down connection", self.stream.shutdown()).await?;

        debug!(bytes = self.transferred, "End marker sent");
        Ok(self.transferred)
    }
}

impl<S: AsyncRead + Unpin> Session<S> {
    /// Read the peer's stream into `sink` until the end marker or the peer
    /// closes.
    ///
    /// A closed stream is reported as [`TransferOutcome::PeerClosed`], not
    /// as an error; `sink` then holds exactly the payload received.
    pub async fn receive_into<W: AsyncWrite + Unpin>(
        &mut self,
        sink: &mut W,
    ) -> Result<TransferReport> {
        let outcome = match self.framing {
            Framing::Sentinel => self.receive_sentinel(sink).await?,
            Framing::Framed => self.receive_framed(sink).await?,
        };

        sink.flush()
            .await
            .map_err(|e| TransferError::Io("flush destination file", e))?;

        Ok(TransferReport {
            bytes: self.transferred,
            outcome,
        })
    }

    async fn receive_sentinel<W: AsyncWrite + Unpin>(
        &mut self,
        sink: &mut W,
    ) -> Result<TransferOutcome> {
        let limit = self.timeout;

        loop {
            let n = deadline(
                limit,
                "read from connection",
                read_retrying(&mut self.stream, &mut self.buffer),
            )
            .await?;
            if n == 0 {
                return Ok(TransferOutcome::PeerClosed);
            }

            let chunk = &self.buffer[..n];
            if protocol::is_sentinel(chunk) {
                debug!(bytes = self.transferred, "End marker received");
                return Ok(TransferOutcome::Completed);
            }

            sink.write_all(chunk)
                .await
                .map_err(|e| TransferError::Io("write destination file", e))?;
            self.transferred += n as u64;
            trace!(bytes = n, total = self.transferred, "Received chunk");
        }
    }

    async fn receive_framed<W: AsyncWrite + Unpin>(
        &mut self,
        sink: &mut W,
    ) -> Result<TransferOutcome> {
        let limit = self.timeout;
        let capacity = self.buffer.len();
        let mut pending = BytesMut::with_capacity(capacity);

        loop {
            // Drain every complete record before reading again
            loop {
                match protocol::parse(&pending) {
                    ParseResult::Complete(Record::Data(payload), consumed) => {
                        sink.write_all(&payload)
                            .await
                            .map_err(|e| TransferError::Io("write destination file", e))?;
                        self.transferred += payload.len() as u64;
                        pending.advance(consumed);
                        trace!(
                            bytes = payload.len(),
                            total = self.transferred,
                            "Received record"
                        );
                    }
                    ParseResult::Complete(Record::End { total }, consumed) => {
                        pending.advance(consumed);
                        if total != self.transferred {
                            return Err(TransferError::LengthMismatch {
                                expected: total,
                                received: self.transferred,
                            });
                        }
                        if !pending.is_empty() {
                            debug!(trailing = pending.len(), "Ignoring bytes after end record");
                        }
                        debug!(bytes = total, "End record received");
                        return Ok(TransferOutcome::Completed);
                    }
                    ParseResult::Incomplete => break,
                    ParseResult::Error(e) => return Err(e.into()),
                }
            }

            pending.reserve(capacity);
            let n = deadline(
                limit,
                "read from connection",
                read_buf_retrying(&mut self.stream, &mut pending),
            )
            .await?;
            if n == 0 {
                if !pending.is_empty() {
                    warn!(partial = pending.len(), "Stream ended inside a record");
                }
                return Ok(TransferOutcome::PeerClosed);
            }
        }
    }
}

/// Run an I/O future under the session deadline, naming the operation in
/// any resulting error.
async fn deadline<T, F>(limit: Option<Duration>, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let result = match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransferError::Timeout(op, limit))?,
        None => fut.await,
    };
    result.map_err(|e| TransferError::Io(op, e))
}

async fn read_retrying<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<usize> {
    loop {
        match reader.read(buf).await {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

async fn read_buf_retrying<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> io::Result<usize> {
    loop {
        match reader.read_buf(buf).await {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
