//! Per-domain engine
//!
//! A hub owns everything for one registered domain: the control socket(s),
//! the table of tickets waiting for their data socket, and the running
//! splices. All of it is mutated from a single event loop; the loop never
//! touches the network directly, socket I/O lives in dedicated tasks that
//! report back through the inbox.

use crate::dispatch::DispatcherHandle;
use crate::manager::WsStream;
use crate::proxy::{write_bad_gateway, RemoteConn};
use crate::splice;
use crate::traffic::TrafficMeter;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use uuid::Uuid;

const INBOX_CAPACITY: usize = 64;
const CONTROL_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a minted ticket waits for its data socket.
    pub ticket_timeout: Duration,
    /// Drain allowance after one side of a splice finishes.
    pub linger: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ticket_timeout: Duration::from_secs(30),
            linger: Duration::from_secs(5),
        }
    }
}

/// An upgraded agent control channel, ready to be bound to a hub.
pub struct ControlSocket {
    pub domain: String,
    pub allow_multiple: bool,
    pub peer_addr: SocketAddr,
    pub socket: WsStream,
}

pub(crate) enum HubEvent {
    /// Bind a freshly upgraded control socket.
    Bind(ControlSocket),
    /// A bound control socket closed or failed.
    ControlClosed(u64),
    /// A public connection for this domain wants a tunnel.
    ClientConn(RemoteConn),
    /// An agent answered a ticket with a data socket.
    AgentConn { ticket: String, socket: WsStream },
    /// A pending ticket ran out its timeout.
    TicketExpired(String),
    /// A splice released its pair.
    SpliceEnded(String),
    Shutdown,
}

pub(crate) struct HubHandle {
    pub tx: mpsc::Sender<HubEvent>,
    pub task: JoinHandle<()>,
}

struct ControlChannel {
    id: u64,
    tx: mpsc::Sender<Message>,
}

struct PendingConn {
    conn: RemoteConn,
    timer: JoinHandle<()>,
}

pub(crate) struct NetworkHub {
    domain: String,
    rx: mpsc::Receiver<HubEvent>,
    tx: mpsc::Sender<HubEvent>,
    dispatcher: DispatcherHandle,
    meter: Arc<TrafficMeter>,
    config: HubConfig,
    controls: Vec<ControlChannel>,
    /// Policy of the first bound control socket; decides whether later
    /// ones may attach.
    allow_multiple: bool,
    next_control: usize,
    next_control_id: u64,
    pending: HashMap<String, PendingConn>,
    splices: HashMap<String, JoinHandle<()>>,
}

impl NetworkHub {
    pub(crate) fn spawn(
        domain: String,
        dispatcher: DispatcherHandle,
        meter: Arc<TrafficMeter>,
        config: HubConfig,
    ) -> HubHandle {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let hub = NetworkHub {
            domain,
            rx,
            tx: tx.clone(),
            dispatcher,
            meter,
            config,
            controls: Vec::new(),
            allow_multiple: false,
            next_control: 0,
            next_control_id: 0,
            pending: HashMap::new(),
            splices: HashMap::new(),
        };
        let task = tokio::spawn(hub.run());
        HubHandle { tx, task }
    }

    async fn run(mut self) {
        debug!(domain = %self.domain, "hub started");
        while let Some(event) = self.rx.recv().await {
            match event {
                HubEvent::Bind(socket) => self.bind(socket),
                HubEvent::ControlClosed(id) => {
                    self.controls.retain(|control| control.id != id);
                    if self.controls.is_empty() {
                        info!(domain = %self.domain, "last control socket closed");
                        break;
                    }
                }
                HubEvent::ClientConn(conn) => self.client_conn(conn),
                HubEvent::AgentConn { ticket, socket } => self.agent_conn(ticket, socket),
                HubEvent::TicketExpired(ticket) => self.ticket_expired(ticket),
                HubEvent::SpliceEnded(ticket) => {
                    self.splices.remove(&ticket);
                }
                HubEvent::Shutdown => break,
            }
        }
        self.shutdown();
    }

    fn bind(&mut self, socket: ControlSocket) {
        if !self.controls.is_empty() && !self.allow_multiple {
            // first registration wins; the newcomer is turned away
            debug!(domain = %self.domain, peer = %socket.peer_addr, "rejecting extra control socket");
            tokio::spawn(close_with_policy(socket.socket));
            return;
        }
        if self.controls.is_empty() {
            self.allow_multiple = socket.allow_multiple;
        }

        let id = self.next_control_id;
        self.next_control_id += 1;

        let (tx, rx) = mpsc::channel(CONTROL_QUEUE);
        tokio::spawn(control_io(socket.socket, rx, self.tx.clone(), id));
        self.controls.push(ControlChannel { id, tx });

        info!(domain = %self.domain, peer = %socket.peer_addr, "control socket bound");
    }

    fn client_conn(&mut self, mut conn: RemoteConn) {
        if self.controls.is_empty() {
            debug!(domain = %self.domain, "no control socket, refusing connection");
            tokio::spawn(async move { write_bad_gateway(&mut conn.stream).await });
            return;
        }

        let ticket = Uuid::new_v4().to_string();
        let notice = serde_json::json!({ "uuid": ticket }).to_string();

        // round-robin over live control sockets; skip any that are full
        // or already gone
        let mut offered = false;
        for _ in 0..self.controls.len() {
            let index = self.next_control % self.controls.len();
            self.next_control = self.next_control.wrapping_add(1);
            if self.controls[index]
                .tx
                .try_send(Message::Text(notice.clone()))
                .is_ok()
            {
                offered = true;
                break;
            }
        }
        if !offered {
            debug!(domain = %self.domain, "no control socket accepted the ticket");
            tokio::spawn(async move { write_bad_gateway(&mut conn.stream).await });
            return;
        }

        let timer = tokio::spawn({
            let hub_tx = self.tx.clone();
            let ticket = ticket.clone();
            let wait = self.config.ticket_timeout;
            async move {
                tokio::time::sleep(wait).await;
                let _ = hub_tx.send(HubEvent::TicketExpired(ticket)).await;
            }
        });

        debug!(domain = %self.domain, %ticket, peer = %conn.peer_addr, "ticket issued");
        self.pending.insert(ticket, PendingConn { conn, timer });
    }

    fn agent_conn(&mut self, ticket: String, socket: WsStream) {
        let Some(pending) = self.pending.remove(&ticket) else {
            // stale, expired or forged; the data socket gets nothing
            debug!(domain = %self.domain, %ticket, "no pending connection for ticket");
            tokio::spawn(async move {
                let mut socket = socket;
                let _ = socket.close(None).await;
            });
            return;
        };
        pending.timer.abort();

        debug!(domain = %self.domain, %ticket, "splice starting");
        let handle = tokio::spawn(splice::run_splice(
            pending.conn,
            socket,
            ticket.clone(),
            self.meter.clone(),
            self.config.linger,
            self.tx.clone(),
        ));
        self.splices.insert(ticket, handle);
    }

    fn ticket_expired(&mut self, ticket: String) {
        if let Some(pending) = self.pending.remove(&ticket) {
            debug!(domain = %self.domain, %ticket, "ticket expired");
            let mut conn = pending.conn;
            tokio::spawn(async move { write_bad_gateway(&mut conn.stream).await });
        }
    }

    fn shutdown(mut self) {
        debug!(domain = %self.domain, "hub shutting down");

        // refuse further events, then flush whatever already got in: a
        // sender that raced the shutdown would otherwise see a successful
        // delivery while its connection silently dies here
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                HubEvent::ClientConn(mut conn) => {
                    tokio::spawn(async move { write_bad_gateway(&mut conn.stream).await });
                }
                HubEvent::AgentConn { mut socket, .. } => {
                    tokio::spawn(async move {
                        let _ = socket.close(None).await;
                    });
                }
                HubEvent::Bind(control) => {
                    tokio::spawn(async move {
                        let mut socket = control.socket;
                        let _ = socket.close(None).await;
                    });
                }
                _ => {}
            }
        }

        // free the domain right away so a reconnecting agent is not turned
        // away while the unregister message is still in flight
        self.dispatcher.registry().remove(&self.domain);

        // dropping the senders makes each control task close its socket
        self.controls.clear();

        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
            let mut conn = pending.conn;
            tokio::spawn(async move { write_bad_gateway(&mut conn.stream).await });
        }

        for (_, splice) in self.splices.drain() {
            splice.abort();
        }

        let dispatcher = self.dispatcher.clone();
        let domain = self.domain.clone();
        tokio::spawn(async move { dispatcher.unregister(&domain).await });

        info!(domain = %self.domain, "hub closed");
    }
}

/// Single I/O task of one bound control socket. Relays outgoing ticket
/// messages and watches for the agent going away.
async fn control_io(
    socket: WsStream,
    mut rx: mpsc::Receiver<Message>,
    hub_tx: mpsc::Sender<HubEvent>,
    id: u64,
) {
    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => {
                    // the hub let go of this channel; part politely
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // nothing flows agent to server here
                Some(Err(e)) => {
                    debug!("control socket error: {}", e);
                    break;
                }
            },
        }
    }
    let _ = hub_tx.send(HubEvent::ControlClosed(id)).await;
}

async fn close_with_policy(mut socket: WsStream) {
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: "domain already registered".into(),
    };
    let _ = socket.close(Some(frame)).await;
}
