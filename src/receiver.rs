//! TCP receiver: connects to a sender and writes the stream to a file.

use crate::config::{ReceiverConfig, TransferConfig};
use crate::error::{Result, TransferError};
use crate::session::{Session, TransferOutcome, TransferReport};
use std::io;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Connect to the sender and receive one file into `config.destination`.
///
/// The destination is created or truncated only after the connection is
/// up. A transfer that ends without the end marker is not an error; the
/// report says [`TransferOutcome::PeerClosed`] and the file holds whatever
/// arrived.
pub async fn run_receiver(
    config: &ReceiverConfig,
    transfer: &TransferConfig,
) -> Result<TransferReport> {
    let addr = format!("{}:{}", config.host, config.port);

    let connect = TcpStream::connect((config.host.as_str(), config.port));
    let stream = match transfer.timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| TransferError::Timeout("connect", limit))?,
        None => connect.await,
    }
    .map_err(|e| TransferError::Connect(addr.clone(), e))?;

    info!(peer = %addr, framing = ?transfer.framing, "Connected to sender");

    let mut file = open_destination(&config.destination)
        .await
        .map_err(|e| TransferError::OpenDestination(config.destination.clone(), e))?;

    let mut session = Session::new(stream, transfer);
    let report = match session.receive_into(&mut file).await {
        Ok(report) => report,
        Err(e) => {
            // Leave the destination holding every byte received so far.
            if let Err(flush_err) = file.flush().await {
                debug!(error = %flush_err, "Failed to flush destination after abort");
            }
            warn!(bytes = session.transferred(), "Transfer aborted");
            return Err(e);
        }
    };

    match report.outcome {
        TransferOutcome::Completed => info!(
            bytes = report.bytes,
            destination = %config.destination.display(),
            "Transfer completed"
        ),
        TransferOutcome::PeerClosed => warn!(
            bytes = report.bytes,
            destination = %config.destination.display(),
            "Sender closed the connection before the end marker; destination is truncated"
        ),
    }

    Ok(report)
}

/// Create or truncate the destination, owner read/write, others read.
async fn open_destination(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o644);
    options.open(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Framing;
    use std::path::PathBuf;
    use std::time::Duration;

    fn transfer() -> TransferConfig {
        TransferConfig {
            buffer_size: 1024,
            framing: Framing::Framed,
            timeout: Some(Duration::from_secs(5)),
        }
    }

    fn config(port: u16, destination: PathBuf) -> ReceiverConfig {
        ReceiverConfig {
            host: "127.0.0.1".to_string(),
            port,
            destination,
        }
    }

    /// A port with nothing listening on it.
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        let err = run_receiver(&config(closed_port(), dest.clone()), &transfer())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Connect(..)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_unwritable_destination() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("no-such-dir").join("out.bin");

        let err = run_receiver(&config(port, dest), &transfer()).await.unwrap_err();
        assert!(matches!(err, TransferError::OpenDestination(..)));
    }

    #[tokio::test]
    async fn test_truncates_existing_destination() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, b"stale contents from a previous run").unwrap();

        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut wire = bytes::BytesMut::new();
            crate::protocol::encode_data(b"fresh", &mut wire);
            crate::protocol::encode_end(5, &mut wire);
            stream.write_all(&wire).await.unwrap();
        });

        let report = run_receiver(&config(port, dest.clone()), &transfer()).await.unwrap();
        peer.await.unwrap();

        assert_eq!(report.outcome, TransferOutcome::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_aborted_transfer_keeps_received_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        // One good record followed by a byte no framing knows.
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut wire = bytes::BytesMut::new();
            crate::protocol::encode_data(b"partial", &mut wire);
            wire.extend_from_slice(&[0xff]);
            stream.write_all(&wire).await.unwrap();
        });

        let err = run_receiver(&config(port, dest.clone()), &transfer()).await.unwrap_err();
        peer.await.unwrap();

        assert!(matches!(err, TransferError::Frame(_)));
        assert_eq!(std::fs::read(&dest).unwrap(), b"partial");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_destination_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        // Peer closes without sending anything.
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let report = run_receiver(&config(port, dest.clone()), &transfer()).await.unwrap();
        peer.await.unwrap();

        assert_eq!(report.outcome, TransferOutcome::PeerClosed);
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        // umask may clear bits but never adds them
        assert_eq!(mode & !0o644, 0);
        assert_ne!(mode & 0o600, 0);
    }
}
