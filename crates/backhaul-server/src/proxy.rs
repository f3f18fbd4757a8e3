//! Public listener
//!
//! Accepts raw TCP on the proxy port, sniffs the destination domain from
//! the first bytes and hands the wrapped connection to the dispatcher.
//! Everything after that is the owning hub's business.

use crate::dispatch::DispatcherHandle;
use crate::sniff::peek_domain;
use crate::stream::PrefixedStream;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// An accepted public connection awaiting tunneling.
///
/// The stream replays the sniffed prefix, so whoever drains it sees the
/// client's bytes from the very first one.
#[derive(Debug)]
pub struct RemoteConn {
    pub domain: String,
    pub stream: PrefixedStream<TcpStream>,
    pub peer_addr: SocketAddr,
}

const BAD_GATEWAY_BODY: &str = "<!DOCTYPE html>\n<html>\n<head>\n    <title>502 Bad Gateway</title>\n</head>\n<body>\n    <h1>Bad Gateway</h1>\n    <p>The tunnel for this host is not available right now.</p>\n</body>\n</html>\n";

/// Write the fixed 502 response and close the connection.
///
/// Used for unknown domains, dead control sockets, expired tickets and
/// overload drops. Write errors are ignored, the connection is being
/// discarded either way.
pub(crate) async fn write_bad_gateway<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        BAD_GATEWAY_BODY.len(),
        BAD_GATEWAY_BODY
    );
    let _ = writer.write_all(response.as_bytes()).await;
    let _ = writer.shutdown().await;
}

pub struct ProxyListener {
    listener: TcpListener,
    dispatcher: DispatcherHandle,
}

impl ProxyListener {
    pub async fn bind(addr: SocketAddr, dispatcher: DispatcherHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("proxy listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        handle_conn(stream, peer_addr, dispatcher).await;
                    });
                }
                Err(e) => {
                    error!("proxy accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_conn(mut stream: TcpStream, peer_addr: SocketAddr, dispatcher: DispatcherHandle) {
    let (domain, prefix) = match peek_domain(&mut stream).await {
        Ok(found) => found,
        Err(e) => {
            debug!("no host from {}: {}", peer_addr, e);
            write_bad_gateway(&mut stream).await;
            return;
        }
    };

    debug!(%domain, %peer_addr, "public connection");

    let conn = RemoteConn {
        domain,
        stream: PrefixedStream::new(prefix, stream),
        peer_addr,
    };

    // Bounded inbox: when the dispatcher is saturated the connection is
    // refused rather than queued without limit.
    if let Err(mut conn) = dispatcher.remote_conn(conn) {
        debug!(peer_addr = %conn.peer_addr, "dispatcher saturated, refusing connection");
        write_bad_gateway(&mut conn.stream).await;
    }
}
