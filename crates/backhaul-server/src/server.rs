//! Server assembly
//!
//! Wires the dispatcher, the public listener and the control listener
//! together and hands back a handle for observation and orderly shutdown.

use crate::auth::AuthManager;
use crate::config::{parse_listen_addr, ConfigError, ServerConfig};
use crate::dispatch::{Dispatcher, DispatcherHandle};
use crate::manager::{ManagerError, ManagerListener};
use crate::proxy::ProxyListener;
use crate::traffic::TrafficMeter;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("failed to bind proxy listener: {0}")]
    ProxyBind(std::io::Error),
}

pub struct Server;

impl Server {
    /// Bind both listeners and start the dispatch loop.
    pub async fn start(config: ServerConfig) -> Result<ServerHandle, ServerError> {
        let meter = Arc::new(TrafficMeter::new());
        let auth = Arc::new(AuthManager::new(config.auth.tokens.clone()));

        let (dispatcher, handle) = Dispatcher::new(meter.clone(), config.hub_config());
        let dispatcher_task = tokio::spawn(dispatcher.run());

        let proxy_bind = parse_listen_addr(&config.proxy.addr)?;
        let manager_bind = parse_listen_addr(&config.manager.addr)?;

        let proxy = ProxyListener::bind(proxy_bind, handle.clone())
            .await
            .map_err(ServerError::ProxyBind)?;
        let manager = ManagerListener::bind(
            manager_bind,
            config.manager.cert.as_deref(),
            config.manager.key.as_deref(),
            handle.clone(),
            auth,
        )
        .await?;

        let proxy_addr = proxy.local_addr().map_err(ServerError::ProxyBind)?;
        let manager_addr = manager.local_addr().map_err(|source| ManagerError::Bind {
            addr: manager_bind,
            source,
        })?;

        let listeners = vec![tokio::spawn(proxy.run()), tokio::spawn(manager.run())];

        Ok(ServerHandle {
            proxy_addr,
            manager_addr,
            dispatcher: handle,
            dispatcher_task,
            listeners,
            meter,
        })
    }
}

pub struct ServerHandle {
    pub proxy_addr: SocketAddr,
    pub manager_addr: SocketAddr,
    dispatcher: DispatcherHandle,
    dispatcher_task: JoinHandle<()>,
    listeners: Vec<JoinHandle<()>>,
    meter: Arc<TrafficMeter>,
}

impl ServerHandle {
    /// Total bytes moved across all splices so far, both directions.
    pub fn traffic_total(&self) -> u64 {
        self.meter.total()
    }

    /// Whether a domain currently has a registered hub.
    pub fn domain_registered(&self, domain: &str) -> bool {
        self.dispatcher.registry().contains(domain)
    }

    /// Stop accepting, shut every hub down and wait for them to finish.
    pub async fn shutdown(mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        self.dispatcher.shutdown().await;
        let _ = (&mut self.dispatcher_task).await;
        info!("server stopped, {} bytes tunneled", self.meter.total());
    }
}
