//! Control listener and WebSocket upgrade endpoints
//!
//! Agents reach the server on the manager port, optionally behind TLS.
//! Two upgrade endpoints are served: `/ws/{domain}` binds a long-lived
//! control socket after bearer-token authorization, `/ws/{domain}/{ticket}`
//! answers a previously issued ticket with a data socket. Refusals (401,
//! 404, 409) happen inside the handshake, before the upgrade completes.

use crate::auth::AuthManager;
use crate::dispatch::DispatcherHandle;
use crate::hub::ControlSocket;
use backhaul_proto::WsPath;
use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub type WsStream = WebSocketStream<ManagerStream>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("failed to bind manager listener on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("invalid tls material: {0}")]
    BadTlsMaterial(String),

    #[error("certificate and key must be configured together")]
    IncompleteTlsMaterial,
}

/// Control-port stream, TLS or plain depending on configuration.
pub enum ManagerStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for ManagerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ManagerStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ManagerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ManagerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ManagerStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ManagerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ManagerStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ManagerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ManagerStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ManagerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

pub struct ManagerListener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    dispatcher: DispatcherHandle,
    auth: Arc<AuthManager>,
}

impl ManagerListener {
    pub async fn bind(
        addr: SocketAddr,
        cert_pem: Option<&str>,
        key_pem: Option<&str>,
        dispatcher: DispatcherHandle,
        auth: Arc<AuthManager>,
    ) -> Result<Self, ManagerError> {
        let acceptor = match (cert_pem, key_pem) {
            (Some(cert), Some(key)) => Some(build_tls_acceptor(cert, key)?),
            (None, None) => None,
            _ => return Err(ManagerError::IncompleteTlsMaterial),
        };

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ManagerError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| ManagerError::Bind { addr, source })?;
        info!(
            "manager listening on {}{}",
            local,
            if acceptor.is_some() { " (tls)" } else { "" }
        );

        Ok(Self {
            listener,
            acceptor,
            dispatcher,
            auth,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let acceptor = self.acceptor.clone();
                    let dispatcher = self.dispatcher.clone();
                    let auth = self.auth.clone();
                    tokio::spawn(async move {
                        handle_upgrade(stream, peer_addr, acceptor, dispatcher, auth).await;
                    });
                }
                Err(e) => {
                    error!("manager accept error: {}", e);
                }
            }
        }
    }
}

enum UpgradeRoute {
    Control {
        domain: String,
        allow_multiple: bool,
    },
    Data {
        domain: String,
        ticket: String,
    },
}

async fn handle_upgrade(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    dispatcher: DispatcherHandle,
    auth: Arc<AuthManager>,
) {
    let stream = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => ManagerStream::Tls(Box::new(tls)),
            Err(e) => {
                warn!("tls handshake failed from {}: {}", peer_addr, e);
                return;
            }
        },
        None => ManagerStream::Plain(stream),
    };

    let mut route = None;
    let callback = |request: &Request, response: Response| {
        match screen_upgrade(request, &auth, &dispatcher) {
            Ok(accepted) => {
                route = Some(accepted);
                Ok(response)
            }
            Err(status) => {
                debug!(%peer_addr, %status, "upgrade refused");
                let mut refusal = ErrorResponse::new(None);
                *refusal.status_mut() = status;
                Err(refusal)
            }
        }
    };

    let socket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("websocket handshake failed from {}: {}", peer_addr, e);
            return;
        }
    };

    match route {
        Some(UpgradeRoute::Control {
            domain,
            allow_multiple,
        }) => {
            dispatcher
                .register(ControlSocket {
                    domain,
                    allow_multiple,
                    peer_addr,
                    socket,
                })
                .await;
        }
        Some(UpgradeRoute::Data { domain, ticket }) => {
            dispatcher.data_socket(domain, ticket, socket).await;
        }
        None => {}
    }
}

/// Decide an upgrade request before completing the handshake. Control
/// sockets need a valid bearer token and a free domain; data sockets are
/// vouched for by their one-time ticket.
fn screen_upgrade(
    request: &Request,
    auth: &AuthManager,
    dispatcher: &DispatcherHandle,
) -> Result<UpgradeRoute, StatusCode> {
    match WsPath::parse(request.uri().path()) {
        None => Err(StatusCode::NOT_FOUND),
        Some(WsPath::Control { domain }) => {
            let grant = auth
                .authorize(&domain, bearer_token(request))
                .map_err(|e| {
                    debug!(%domain, "authorization failed: {}", e);
                    StatusCode::UNAUTHORIZED
                })?;
            if dispatcher.registry().allow_multiple(&domain) == Some(false) {
                return Err(StatusCode::CONFLICT);
            }
            Ok(UpgradeRoute::Control {
                domain,
                allow_multiple: grant.allow_multiple,
            })
        }
        Some(WsPath::Data { domain, ticket }) => Ok(UpgradeRoute::Data { domain, ticket }),
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    let header = request.headers().get("authorization")?.to_str().ok()?;
    let (scheme, token) = header.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}

fn build_tls_acceptor(cert_pem: &str, key_pem: &str) -> Result<TlsAcceptor, ManagerError> {
    ensure_crypto_provider();

    let certs = rustls_pemfile::certs(&mut Cursor::new(cert_pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ManagerError::BadTlsMaterial(format!("certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(ManagerError::BadTlsMaterial(
            "certificate: no PEM blocks found".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut Cursor::new(key_pem.as_bytes()))
        .map_err(|e| ManagerError::BadTlsMaterial(format!("key: {}", e)))?
        .ok_or_else(|| ManagerError::BadTlsMaterial("key: no PEM blocks found".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ManagerError::BadTlsMaterial(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(path);
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(
            bearer_token(&request("/ws/a.test", Some("Bearer secret"))),
            Some("secret")
        );
        assert_eq!(
            bearer_token(&request("/ws/a.test", Some("bearer secret"))),
            Some("secret")
        );
        assert_eq!(bearer_token(&request("/ws/a.test", Some("Basic abc"))), None);
        assert_eq!(bearer_token(&request("/ws/a.test", None)), None);
    }

    #[test]
    fn test_screen_rejects_unknown_paths() {
        let auth = AuthManager::default();
        let (_, handle) = crate::dispatch::Dispatcher::new(
            Arc::new(crate::traffic::TrafficMeter::new()),
            crate::hub::HubConfig::default(),
        );
        let result = screen_upgrade(&request("/api/health", None), &auth, &handle);
        assert_eq!(result.err(), Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_screen_requires_token_when_configured() {
        let auth = AuthManager::new(vec![crate::auth::TokenEntry {
            token: "secret".to_string(),
            allow_multiple: false,
            domains: Vec::new(),
        }]);
        let (_, handle) = crate::dispatch::Dispatcher::new(
            Arc::new(crate::traffic::TrafficMeter::new()),
            crate::hub::HubConfig::default(),
        );

        let refused = screen_upgrade(&request("/ws/a.test", None), &auth, &handle);
        assert_eq!(refused.err(), Some(StatusCode::UNAUTHORIZED));

        let allowed = screen_upgrade(&request("/ws/a.test", Some("Bearer secret")), &auth, &handle);
        assert!(allowed.is_ok());
    }

    #[test]
    fn test_data_upgrade_needs_no_token() {
        let auth = AuthManager::new(vec![crate::auth::TokenEntry {
            token: "secret".to_string(),
            allow_multiple: false,
            domains: Vec::new(),
        }]);
        let (_, handle) = crate::dispatch::Dispatcher::new(
            Arc::new(crate::traffic::TrafficMeter::new()),
            crate::hub::HubConfig::default(),
        );
        let result = screen_upgrade(&request("/ws/a.test/ticket-1", None), &auth, &handle);
        assert!(matches!(result, Ok(UpgradeRoute::Data { .. })));
    }

    #[test]
    fn test_malformed_pem_fails_loudly() {
        let err = build_tls_acceptor("not a certificate", "not a key");
        assert!(matches!(err, Err(ManagerError::BadTlsMaterial(_))));
    }

    #[tokio::test]
    async fn test_cert_without_key_is_refused() {
        let (_, handle) = crate::dispatch::Dispatcher::new(
            Arc::new(crate::traffic::TrafficMeter::new()),
            crate::hub::HubConfig::default(),
        );
        let result = ManagerListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Some("cert"),
            None,
            handle,
            Arc::new(AuthManager::default()),
        )
        .await;
        assert!(matches!(result, Err(ManagerError::IncompleteTlsMaterial)));
    }
}
