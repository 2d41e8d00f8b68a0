//! Subcommand implementations.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use rand::RngCore;
use roomdrop_rendezvous::{RelayConfig, RelayServer, WsRendezvous};
use roomdrop_session::tcp::TcpConnector;
use roomdrop_session::{SessionEvent, SessionHandle};
use roomdrop_transfer::safe_file_name;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

/// Runs the rendezvous relay until Ctrl-C.
pub async fn relay(listen: SocketAddr) -> anyhow::Result<()> {
    let server = RelayServer::new(RelayConfig { bind_addr: listen });
    let serving = Arc::clone(&server);
    let mut task = tokio::spawn(async move { serving.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("interrupted, stopping relay");
            server.shutdown();
            (&mut task).await.context("relay task panicked")??;
        }
        result = &mut task => {
            result.context("relay task panicked")??;
        }
    }
    Ok(())
}

/// A short random room name.
pub fn random_room() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn open_session(config: &AppConfig, url: &str) -> anyhow::Result<SessionHandle> {
    let rendezvous = WsRendezvous::connect(url)
        .await
        .with_context(|| format!("cannot reach rendezvous relay at {url}"))?;
    Ok(SessionHandle::spawn(
        Arc::new(rendezvous),
        Arc::new(TcpConnector::new(config.tcp_config())),
        config.session_config(),
    ))
}

/// Sends `path` to whoever joins `room`.
pub async fn send(config: &AppConfig, url: &str, room: &str, path: &Path) -> anyhow::Result<()> {
    if !path.is_file() {
        bail!("{} is not a file", path.display());
    }

    let session = open_session(config, url).await?;
    let mut events = session.take_events().context("session events already taken")?;
    session.join_room(room).await?;
    println!("room: {room}");
    info!(%room, file = %path.display(), "waiting for the receiver");

    let outcome: anyhow::Result<()> = async {
        tokio::select! {
            connected = session.wait_connected() => connected?,
            reason = negotiation_failure(&mut events) => bail!("negotiation failed: {reason}"),
        }

        let sending = async { anyhow::Ok(session.send_path(path).await?.wait().await?) };
        let report = drain_while(sending, &mut events).await?;
        info!(bytes = report.bytes_sent, chunks = report.chunks_sent, "file sent");
        anyhow::Ok(())
    }
    .await;

    session.shutdown().await;
    outcome
}

/// Receives one file from `room` and writes it to `download_dir`.
pub async fn receive(config: &AppConfig, url: &str, room: &str, download_dir: &Path) -> anyhow::Result<PathBuf> {
    let session = open_session(config, url).await?;
    let mut events = session.take_events().context("session events already taken")?;
    session.join_room(room).await?;
    info!(%room, "waiting for the sender");

    let outcome: anyhow::Result<PathBuf> = async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected { role } => info!(%role, "connected"),
                SessionEvent::TransferStarted { name, size } => {
                    info!(name = name.as_deref().unwrap_or("-"), size, "receiving");
                }
                SessionEvent::TransferProgress(p) => {
                    info!(
                        received = p.transferred,
                        total = p.total,
                        percent = %format!("{:.1}", p.fraction() * 100.0),
                        "progress"
                    );
                }
                SessionEvent::FileReceived { name, bytes } => {
                    let path = save_received(download_dir, name.as_deref(), &bytes).await?;
                    info!(path = %path.display(), size = bytes.len(), "file saved");
                    return Ok(path);
                }
                SessionEvent::TransferFailed { reason } => warn!(%reason, "transfer failed"),
                SessionEvent::NegotiationFailed { reason } => bail!("negotiation failed: {reason}"),
                SessionEvent::Closed => bail!("session closed before a file arrived"),
                SessionEvent::StateChanged(_) | SessionEvent::RoleAssigned(_) => {}
            }
        }
        bail!("session stopped")
    }
    .await;

    session.shutdown().await;
    outcome
}

async fn negotiation_failure(events: &mut tokio::sync::mpsc::Receiver<SessionEvent>) -> String {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::NegotiationFailed { reason } => return reason,
            SessionEvent::RoleAssigned(role) => info!(%role, "role assigned"),
            _ => {}
        }
    }
    "session stopped".into()
}

/// Drives `work` to completion while draining and logging session events.
async fn drain_while<T>(
    work: impl Future<Output = T>,
    events: &mut tokio::sync::mpsc::Receiver<SessionEvent>,
) -> T {
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return output,
            event = events.recv() => match event {
                Some(SessionEvent::TransferFailed { reason }) => warn!(%reason, "transfer failed"),
                Some(event) => debug!(?event, "session event"),
                None => return work.await,
            },
        }
    }
}

/// Writes `bytes` into `dir` under a sanitized form of `suggested`.
///
/// Existing files are never overwritten: a numeric suffix is added instead.
pub async fn save_received(dir: &Path, suggested: Option<&str>, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create {}", dir.display()))?;

    let name = safe_file_name(suggested);
    let path = unused_path(dir, &name).await;
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("cannot write {}", path.display()))?;
    Ok(path)
}

async fn unused_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let mut n = 1u32;
    loop {
        let file = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(file);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_rooms_are_short_hex() {
        let room = random_room();
        assert_eq!(room.len(), 8);
        assert!(room.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(room, random_room());
    }

    #[tokio::test]
    async fn events_are_drained_while_work_runs() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let producer = async move {
            for _ in 0..10 {
                tx.send(SessionEvent::Closed).await.unwrap();
            }
            7
        };
        assert_eq!(drain_while(producer, &mut rx).await, 7);
    }

    #[tokio::test]
    async fn closed_event_stream_still_finishes_work() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<SessionEvent>(1);
        drop(tx);
        let work = async {
            tokio::task::yield_now().await;
            "done"
        };
        assert_eq!(drain_while(work, &mut rx).await, "done");
    }

    #[tokio::test]
    async fn received_file_lands_under_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_received(dir.path(), Some("notes.txt"), b"hi").await.unwrap();
        assert_eq!(path, dir.path().join("notes.txt"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn hostile_names_stay_inside_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_received(dir.path(), Some("../../etc/passwd"), b"x").await.unwrap();
        assert_eq!(path, dir.path().join("passwd"));

        let path = save_received(dir.path(), None, b"y").await.unwrap();
        assert_eq!(path, dir.path().join("received.bin"));
    }

    #[tokio::test]
    async fn existing_files_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        save_received(dir.path(), Some("a.txt"), b"1").await.unwrap();
        let second = save_received(dir.path(), Some("a.txt"), b"2").await.unwrap();
        assert_eq!(second, dir.path().join("a (1).txt"));
        let third = save_received(dir.path(), Some("a.txt"), b"3").await.unwrap();
        assert_eq!(third, dir.path().join("a (2).txt"));
        assert_eq!(tokio::fs::read(dir.path().join("a.txt")).await.unwrap(), b"1");
    }
}
