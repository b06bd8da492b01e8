use crate::core::PollerEvent;
use crate::LogLine;
use scrobble_proto::cache::ResultCache;
use scrobble_proto::protocol::{
    Broadcast, CacheEntry, Command, FrameError, Message, PROTOCOL_VERSION,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    cache: Arc<ResultCache>,
    event_tx: mpsc::Sender<PollerEvent>,
    log_tx: broadcast::Sender<LogLine>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, cache, event_tx, log_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    cache: Arc<ResultCache>,
    event_tx: mpsc::Sender<PollerEvent>,
    log_tx: broadcast::Sender<LogLine>,
) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                // Subscribe before the Hello snapshot so no publish slips between.
                let entries = cache.subscribe();
                let logs = log_tx.subscribe();
                let cache = cache.clone();
                let evt_tx = event_tx.clone();

                tokio::spawn(async move {
                    let (read_half, write_half) = stream.into_split();
                    handle_client(read_half, write_half, cache, id, evt_tx, entries, logs).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client<R, W>(
    mut read_half: R,
    mut write_half: W,
    cache: Arc<ResultCache>,
    client_id: usize,
    event_tx: mpsc::Sender<PollerEvent>,
    mut entries: broadcast::Receiver<CacheEntry>,
    mut logs: broadcast::Receiver<LogLine>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        entry: cache.snapshot(),
    };
    if send(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        debug!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match Message::decode(&read_buf) {
                                Ok(None) => break,
                                Ok(Some((Message::Command(Command::GetLatest), consumed))) => {
                                    read_buf.drain(..consumed);
                                    let latest = Broadcast::Latest { entry: cache.snapshot() };
                                    if send(&mut write_half, latest).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(Some((Message::Command(cmd), consumed))) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(PollerEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("PollerEvent channel closed");
                                        return;
                                    }
                                }
                                Ok(Some((_, consumed))) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(FrameError::Malformed { frame_len, source }) => {
                                    warn!("Client {} sent a malformed frame: {}", client_id, source);
                                    read_buf.drain(..frame_len);
                                }
                                Err(e @ FrameError::TooLarge(_)) => {
                                    warn!("Dropping client {}: {}", client_id, e);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            entry = entries.recv() => {
                match entry {
                    Ok(entry) => {
                        if send(&mut write_half, Broadcast::Latest { entry }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Only the newest entry matters; resync from the cache.
                        warn!("Client {} missed {} cache updates", client_id, n);
                        let latest = Broadcast::Latest { entry: cache.snapshot() };
                        if send(&mut write_half, latest).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            line = logs.recv() => {
                match line {
                    Ok(LogLine(message)) => {
                        if send(&mut write_half, Broadcast::Log { message }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, broadcast: Broadcast) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}
