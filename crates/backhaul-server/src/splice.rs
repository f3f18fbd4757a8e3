//! Byte pumps between a public connection and a data socket
//!
//! Each matched pair runs two unidirectional pumps. Client bytes are framed
//! as binary WebSocket messages toward the agent; binary payloads from the
//! agent are written back to the client in order. WebSocket has no
//! half-close, so when one direction finishes the other gets a bounded
//! linger to drain before both handles are dropped. Pump errors end the
//! splice and are logged; they never reach the hub as control events.

use crate::hub::HubEvent;
use crate::manager::WsStream;
use crate::proxy::RemoteConn;
use crate::traffic::TrafficMeter;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Read unit of the client-side pump.
const BUFFER_SIZE: usize = 64 * 1024;

/// Run both pumps to completion, then report back to the hub.
pub(crate) async fn run_splice(
    conn: RemoteConn,
    socket: WsStream,
    ticket: String,
    meter: Arc<TrafficMeter>,
    linger: Duration,
    hub_tx: mpsc::Sender<HubEvent>,
) {
    let domain = conn.domain.clone();
    let (to_agent, to_client) = splice(conn, socket, &meter, linger).await;
    debug!(%domain, %ticket, to_agent, to_client, "splice finished");
    let _ = hub_tx.send(HubEvent::SpliceEnded(ticket)).await;
}

async fn splice(
    conn: RemoteConn,
    socket: WsStream,
    meter: &TrafficMeter,
    linger: Duration,
) -> (u64, u64) {
    let (mut client_read, mut client_write) = tokio::io::split(conn.stream);
    let (mut agent_sink, mut agent_source) = socket.split();

    let to_agent = AtomicU64::new(0);
    let to_client = AtomicU64::new(0);

    {
        let inbound = async {
            let mut buf = vec![0u8; BUFFER_SIZE];
            loop {
                match client_read.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if agent_sink
                            .send(Message::Binary(buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        meter.add(n as u64);
                        to_agent.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        debug!("client read error: {}", e);
                        break;
                    }
                }
            }
        };

        let outbound = async {
            while let Some(message) = agent_source.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        if let Err(e) = client_write.write_all(&data).await {
                            debug!("client write error: {}", e);
                            break;
                        }
                        meter.add(data.len() as u64);
                        to_client.fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("agent socket error: {}", e);
                        break;
                    }
                }
            }
            // agent is done sending; half-close toward the public client
            let _ = client_write.shutdown().await;
        };

        tokio::pin!(inbound);
        tokio::pin!(outbound);
        tokio::select! {
            _ = &mut inbound => {
                // client went quiet; allow the agent a linger to drain
                let _ = timeout(linger, &mut outbound).await;
            }
            _ = &mut outbound => {
                let _ = timeout(linger, &mut inbound).await;
            }
        }
    }

    let _ = agent_sink.close().await;
    let _ = client_write.shutdown().await;

    (
        to_agent.load(Ordering::Relaxed),
        to_client.load(Ordering::Relaxed),
    )
}
