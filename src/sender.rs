//! TCP sender: listens for receivers and streams the source file to each.
//!
//! Each accepted connection gets its own task and its own file handle.
//! After the configured number of sessions the listening socket is closed,
//! so later receivers are refused rather than left waiting.

use crate::config::{Framing, SenderConfig, TransferConfig};
use crate::error::{Result, TransferError};
use crate::session::Session;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pending connection queue length.
const LISTEN_BACKLOG: i32 = 16;

/// Session counts reported when the sender stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SenderSummary {
    pub completed: u64,
    pub failed: u64,
}

impl SenderSummary {
    fn record(&mut self, result: std::result::Result<Result<u64>, JoinError>) {
        match result {
            Ok(Ok(_)) => self.completed += 1,
            Ok(Err(_)) => self.failed += 1,
            Err(e) => {
                error!(error = %e, "Session task aborted");
                self.failed += 1;
            }
        }
    }
}

/// Sender instance
pub struct Sender {
    config: SenderConfig,
    transfer: TransferConfig,
    listener: TcpListener,
    session_limit: Arc<Semaphore>,
}

impl Sender {
    /// Resolve the configured host and bind the listening socket.
    pub async fn bind(config: SenderConfig, transfer: TransferConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let bound = listen_on(&config.host, config.port)
            .await
            .and_then(|listener| Ok((listener.local_addr()?, listener)));
        let (local, listener) = bound.map_err(|e| TransferError::Bind(addr, e))?;

        info!(
            address = %local,
            source = %config.source.display(),
            framing = ?transfer.framing,
            sessions = config.sessions,
            "Sender listening"
        );

        let session_limit = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Sender {
            config,
            transfer,
            listener,
            session_limit,
        })
    }

    /// Address the listener is bound to.
    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the session limit is reached.
    #[cfg(test)]
    pub async fn serve(self) -> Result<SenderSummary> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until the session limit is reached or `shutdown` resolves,
    /// then close the listener and wait for in-flight sessions.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<SenderSummary>
    where
        F: Future<Output = ()>,
    {
        let Sender {
            config,
            transfer,
            listener,
            session_limit,
        } = self;

        let source: Arc<Path> = Arc::from(config.source.as_path());
        let mut summary = SenderSummary::default();
        let mut tasks = JoinSet::new();
        let mut accepted = 0u64;
        tokio::pin!(shutdown);

        while config.sessions == 0 || accepted < config.sessions {
            // Wait for a session slot
            let permit = tokio::select! {
                permit = Arc::clone(&session_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            };

            let (stream, peer) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!(error = %e, "Transient accept failure");
                        continue;
                    }
                    Err(e) => return Err(TransferError::Accept(e)),
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            };

            accepted += 1;
            let source = Arc::clone(&source);
            let span = info_span!("session", id = accepted, peer = %peer);
            tasks.spawn(
                async move {
                    let result = handle_session(stream, &source, &transfer).await;
                    match &result {
                        Ok(bytes) => info!(bytes, "Transfer completed"),
                        Err(e) => error!(error = %e, "Transfer failed"),
                    }
                    drop(permit);
                    result
                }
                .instrument(span),
            );

            while let Some(result) = tasks.try_join_next() {
                summary.record(result);
            }
        }

        drop(listener);
        debug!(in_flight = tasks.len(), "Listener closed");

        while let Some(result) = tasks.join_next().await {
            summary.record(result);
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            "Sender finished"
        );
        Ok(summary)
    }
}

/// Bind, then serve until the session limit is reached or `shutdown`
/// resolves.
pub async fn run_sender<F>(
    config: SenderConfig,
    transfer: TransferConfig,
    shutdown: F,
) -> Result<SenderSummary>
where
    F: Future<Output = ()>,
{
    Sender::bind(config, transfer)
        .await?
        .serve_until(shutdown)
        .await
}

/// Stream the source file over one accepted connection.
///
/// The connection is dropped, and therefore closed, on every return path.
async fn handle_session(
    stream: TcpStream,
    source: &Path,
    transfer: &TransferConfig,
) -> Result<u64> {
    info!("Receiver connected");

    // Sentinel detection needs the marker to arrive as its own segment.
    if transfer.framing == Framing::Sentinel {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
    }

    let mut file = File::open(source)
        .await
        .map_err(|e| TransferError::OpenSource(source.to_path_buf(), e))?;

    let mut session = Session::new(stream, transfer);
    session.send_from(&mut file).await
}

/// Bind the first resolved address that accepts a listener.
async fn listen_on(host: &str, port: u16) -> io::Result<TcpListener> {
    let mut last_err = None;

    for addr in tokio::net::lookup_host((host, port)).await? {
        match create_listener(addr).and_then(TcpListener::from_std) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(address = %addr, error = %e, "Bind attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address found for {host}"),
        )
    }))
}

/// Create a TCP listener with SO_REUSEADDR so a restarted sender can rebind
/// immediately.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}
