//! Agent-side tunnel client
//!
//! The agent keeps one control WebSocket open against the server. Every
//! ticket announced there is answered by dialing a fresh data WebSocket,
//! which gets spliced to a TCP connection into the local target service.
//! Nothing listens locally; all connectivity is dialed outward.

use backhaul_proto::{control_path, data_path, TicketNotice};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FORWARD_BUFFER: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid server url {0:?}, expected ws:// or wss://")]
    BadServerUrl(String),

    #[error("token is not a valid header value")]
    BadToken,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to reach local target: {0}")]
    Target(std::io::Error),

    #[error("control socket closed by server")]
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Manager endpoint without a path, e.g. "wss://relay.example.com:8081".
    pub server_url: String,

    /// Domain to register.
    pub domain: String,

    /// Bearer token, when the server requires one.
    pub token: Option<String>,

    /// Local address tunneled connections are forwarded to.
    pub target_addr: String,

    /// Skip certificate verification (insecure, for development only).
    pub insecure: bool,
}

pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run one control session until the server goes away.
    pub async fn run(&self) -> Result<(), AgentError> {
        let url = endpoint_url(&self.config.server_url, &control_path(&self.config.domain))?;
        let mut control = connect(url, &self.config).await?;
        info!(domain = %self.config.domain, "control channel established");

        while let Some(message) = control.next().await {
            match message? {
                Message::Text(text) => match serde_json::from_str::<TicketNotice>(&text) {
                    Ok(notice) => {
                        let config = self.config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = answer_ticket(config, notice.uuid).await {
                                warn!("failed to answer ticket: {}", e);
                            }
                        });
                    }
                    Err(e) => debug!("unparseable control message: {}", e),
                },
                Message::Close(frame) => {
                    debug!("control channel closed: {:?}", frame);
                    break;
                }
                _ => {}
            }
        }
        Err(AgentError::Disconnected)
    }
}

/// Keep a session open, reconnecting with exponential backoff after every
/// drop. `max_attempts` of zero retries forever.
pub async fn run_with_reconnect(
    config: AgentConfig,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<(), AgentError> {
    let agent = Agent::new(config);
    let mut attempt = 0;
    let mut delay = initial_delay;

    loop {
        attempt += 1;
        match agent.run().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if max_attempts > 0 && attempt >= max_attempts {
                    error!("giving up after {} attempts: {}", attempt, e);
                    return Err(e);
                }
                warn!(
                    "connection lost: {}; reconnecting in {}s",
                    e,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, max_delay);
            }
        }
    }
}

/// Dial the data channel for one ticket and splice it to the local target.
async fn answer_ticket(config: AgentConfig, ticket: String) -> Result<(), AgentError> {
    debug!(%ticket, "answering ticket");

    let url = endpoint_url(&config.server_url, &data_path(&config.domain, &ticket))?;
    let data = connect(url, &config).await?;
    let local = TcpStream::connect(&config.target_addr)
        .await
        .map_err(AgentError::Target)?;

    forward(data, local).await;
    debug!(%ticket, "data channel finished");
    Ok(())
}

/// Pump bytes both ways until both sides are done.
async fn forward(socket: WsClient, local: TcpStream) {
    let (mut sink, mut source) = socket.split();
    let (mut local_read, mut local_write) = local.into_split();

    let to_local = async {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if local_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("data socket error: {}", e);
                    break;
                }
            }
        }
        let _ = local_write.shutdown().await;
    };

    let to_server = async {
        let mut buf = vec![0u8; FORWARD_BUFFER];
        loop {
            match local_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = sink.close().await;
    };

    tokio::join!(to_local, to_server);
}

fn endpoint_url(server_url: &str, path: &str) -> Result<Url, AgentError> {
    let base =
        Url::parse(server_url).map_err(|_| AgentError::BadServerUrl(server_url.to_string()))?;
    if !matches!(base.scheme(), "ws" | "wss") {
        return Err(AgentError::BadServerUrl(server_url.to_string()));
    }
    base.join(path)
        .map_err(|_| AgentError::BadServerUrl(server_url.to_string()))
}

async fn connect(url: Url, config: &AgentConfig) -> Result<WsClient, AgentError> {
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = &config.token {
        let value = format!("Bearer {}", token)
            .parse()
            .map_err(|_| AgentError::BadToken)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let connector = if config.insecure {
        Some(Connector::Rustls(insecure_tls_config()))
    } else {
        None
    };

    let (socket, _response) = connect_async_tls_with_config(request, None, false, connector).await?;
    Ok(socket)
}

fn insecure_tls_config() -> Arc<rustls::ClientConfig> {
    ensure_crypto_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipVerification::new())
        .with_no_client_auth();
    Arc::new(config)
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

/// Certificate verifier that accepts anything (INSECURE).
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
