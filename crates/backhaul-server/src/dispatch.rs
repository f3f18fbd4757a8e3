//! Dispatcher: routes registrations, data sockets and public connections
//!
//! One task owns the domain-to-hub map. Listeners feed it through a bounded
//! inbox and never touch the map themselves. The only connection I/O the
//! dispatcher causes is the 502 written to public connections that have no
//! hub, and that write happens on a spawned task.

use crate::hub::{ControlSocket, HubConfig, HubEvent, HubHandle, NetworkHub};
use crate::manager::WsStream;
use crate::proxy::{write_bad_gateway, RemoteConn};
use crate::traffic::TrafficMeter;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const INBOX_CAPACITY: usize = 256;

pub(crate) enum DispatchEvent {
    Register(ControlSocket),
    Unregister(String),
    RemoteConn(RemoteConn),
    DataSocket {
        domain: String,
        ticket: String,
        socket: WsStream,
    },
    Shutdown,
}

/// Synchronously readable view of the registered domains.
///
/// The dispatcher loop inserts and removes entries; a hub also removes its
/// own entry as it shuts down, so the domain is reclaimable before the
/// unregister message is dequeued. The control listener reads the map
/// inside the upgrade handshake to refuse duplicate registrations before
/// completing the upgrade. The value is the domain's allow-multiple policy.
#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    inner: Arc<RwLock<HashMap<String, bool>>>,
}

impl DomainRegistry {
    /// The domain's allow-multiple policy, or None when unregistered.
    pub fn allow_multiple(&self, domain: &str) -> Option<bool> {
        self.inner.read().ok()?.get(domain).copied()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.allow_multiple(domain).is_some()
    }

    fn insert(&self, domain: String, allow_multiple: bool) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(domain, allow_multiple);
        }
    }

    pub(crate) fn remove(&self, domain: &str) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(domain);
        }
    }

    fn clear(&self) {
        if let Ok(mut map) = self.inner.write() {
            map.clear();
        }
    }
}

#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatchEvent>,
    registry: DomainRegistry,
}

impl DispatcherHandle {
    pub(crate) async fn register(&self, socket: ControlSocket) {
        let _ = self.tx.send(DispatchEvent::Register(socket)).await;
    }

    pub(crate) async fn unregister(&self, domain: &str) {
        let _ = self
            .tx
            .send(DispatchEvent::Unregister(domain.to_string()))
            .await;
    }

    pub(crate) async fn data_socket(&self, domain: String, ticket: String, socket: WsStream) {
        let _ = self
            .tx
            .send(DispatchEvent::DataSocket {
                domain,
                ticket,
                socket,
            })
            .await;
    }

    /// Hand over a public connection. Refuses instead of waiting when the
    /// inbox is full, returning the connection so the caller can 502 it.
    pub(crate) fn remote_conn(&self, conn: RemoteConn) -> Result<(), RemoteConn> {
        match self.tx.try_send(DispatchEvent::RemoteConn(conn)) {
            Ok(()) => Ok(()),
            Err(err) => match err.into_inner() {
                DispatchEvent::RemoteConn(conn) => Err(conn),
                _ => Ok(()), // only RemoteConn events travel through here
            },
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(DispatchEvent::Shutdown).await;
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }
}

pub struct Dispatcher {
    rx: mpsc::Receiver<DispatchEvent>,
    handle: DispatcherHandle,
    hubs: HashMap<String, HubHandle>,
    meter: Arc<TrafficMeter>,
    hub_config: HubConfig,
}

impl Dispatcher {
    pub fn new(meter: Arc<TrafficMeter>, hub_config: HubConfig) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = DispatcherHandle {
            tx,
            registry: DomainRegistry::default(),
        };
        let dispatcher = Self {
            rx,
            handle: handle.clone(),
            hubs: HashMap::new(),
            meter,
            hub_config,
        };
        (dispatcher, handle)
    }

    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                DispatchEvent::Register(socket) => self.register(socket),
                DispatchEvent::Unregister(domain) => {
                    // only reap a hub that has actually stopped; the message
                    // may be from a dead hub whose slot a fresh registration
                    // has already taken over
                    let stopped = self
                        .hubs
                        .get(&domain)
                        .is_some_and(|hub| hub.tx.is_closed());
                    if stopped {
                        self.hubs.remove(&domain);
                        self.handle.registry.remove(&domain);
                        info!(%domain, "domain unregistered");
                    }
                }
                DispatchEvent::RemoteConn(conn) => self.route_conn(conn),
                DispatchEvent::DataSocket {
                    domain,
                    ticket,
                    socket,
                } => self.route_data(domain, ticket, socket),
                DispatchEvent::Shutdown => break,
            }
        }
        self.shutdown().await;
    }

    fn register(&mut self, socket: ControlSocket) {
        let domain = socket.domain.clone();
        let allow_multiple = socket.allow_multiple;
        let mut event = HubEvent::Bind(socket);

        if let Some(hub) = self.hubs.get(&domain) {
            match hub.tx.try_send(event) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%domain, "hub inbox saturated, dropping registration");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(stale)) => {
                    // the hub shut down on its own and its unregister is
                    // still in flight; start over with a fresh one
                    self.hubs.remove(&domain);
                    self.handle.registry.remove(&domain);
                    event = stale;
                }
            }
        }

        info!(%domain, "domain registered");
        let hub = NetworkHub::spawn(
            domain.clone(),
            self.handle.clone(),
            self.meter.clone(),
            self.hub_config.clone(),
        );
        // fresh inbox, the bind cannot be refused
        let _ = hub.tx.try_send(event);
        self.handle.registry.insert(domain.clone(), allow_multiple);
        self.hubs.insert(domain, hub);
    }

    fn route_conn(&mut self, conn: RemoteConn) {
        let Some(hub) = self.hubs.get(&conn.domain) else {
            debug!(domain = %conn.domain, "no hub for domain");
            let mut conn = conn;
            tokio::spawn(async move { write_bad_gateway(&mut conn.stream).await });
            return;
        };
        if let Err(err) = hub.tx.try_send(HubEvent::ClientConn(conn)) {
            if let HubEvent::ClientConn(mut conn) = err.into_inner() {
                debug!(domain = %conn.domain, "hub unavailable, refusing connection");
                tokio::spawn(async move { write_bad_gateway(&mut conn.stream).await });
            }
        }
    }

    fn route_data(&mut self, domain: String, ticket: String, socket: WsStream) {
        let Some(hub) = self.hubs.get(&domain) else {
            debug!(%domain, "data socket for unknown domain");
            tokio::spawn(async move {
                let mut socket = socket;
                let _ = socket.close(None).await;
            });
            return;
        };
        if let Err(err) = hub.tx.try_send(HubEvent::AgentConn { ticket, socket }) {
            if let HubEvent::AgentConn { mut socket, .. } = err.into_inner() {
                debug!(%domain, "hub unavailable for data socket");
                tokio::spawn(async move {
                    let _ = socket.close(None).await;
                });
            }
        }
    }

    async fn shutdown(mut self) {
        info!("dispatcher shutting down");
        self.handle.registry.clear();

        let hubs: Vec<(String, HubHandle)> = self.hubs.drain().collect();
        for (_, hub) in &hubs {
            if hub.tx.try_send(HubEvent::Shutdown).is_err() {
                hub.task.abort();
            }
        }

        let grace = self.hub_config.linger + Duration::from_secs(1);
        for (domain, mut hub) in hubs {
            if timeout(grace, &mut hub.task).await.is_err() {
                warn!(%domain, "hub did not stop in time, aborting");
                hub.task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_reflects_dispatcher_writes() {
        let registry = DomainRegistry::default();
        assert!(!registry.contains("a.test"));

        registry.insert("a.test".to_string(), true);
        assert_eq!(registry.allow_multiple("a.test"), Some(true));

        registry.remove("a.test");
        assert!(!registry.contains("a.test"));
    }

    #[tokio::test]
    async fn test_unknown_domain_gets_bad_gateway() {
        use crate::stream::PrefixedStream;
        use tokio::io::AsyncReadExt;

        let meter = Arc::new(TrafficMeter::new());
        let (dispatcher, handle) = Dispatcher::new(meter, HubConfig::default());
        let dispatcher_task = tokio::spawn(dispatcher.run());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_side, peer_addr) = listener.accept().await.unwrap();

        let conn = RemoteConn {
            domain: "nowhere.test".to_string(),
            stream: PrefixedStream::new(bytes::Bytes::new(), server_side),
            peer_addr,
        };
        handle.remote_conn(conn).unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502"));

        handle.shutdown().await;
        dispatcher_task.await.unwrap();
    }
}
