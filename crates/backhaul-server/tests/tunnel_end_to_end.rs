//! End-to-end tunnel scenarios against a real server on loopback.
//!
//! Each test starts its own server on ephemeral ports and plays both sides:
//! a hand-rolled agent on the manager port and plain TCP clients on the
//! proxy port.

use backhaul_proto::TicketNotice;
use backhaul_server::{Server, ServerConfig, ServerHandle};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

async fn start_server() -> ServerHandle {
    start_server_with(ServerConfig::default()).await
}

async fn start_server_with(mut config: ServerConfig) -> ServerHandle {
    config.proxy.addr = "127.0.0.1:0".to_string();
    config.manager.addr = "127.0.0.1:0".to_string();
    Server::start(config).await.expect("server should start")
}

async fn connect_control(manager: SocketAddr, domain: &str) -> Ws {
    let (socket, _) = connect_async(format!("ws://{}/ws/{}", manager, domain))
        .await
        .expect("control upgrade should succeed");
    socket
}

async fn wait_registered(handle: &ServerHandle, domain: &str) {
    for _ in 0..500 {
        if handle.domain_registered(domain) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("domain {} never registered", domain);
}

async fn wait_unregistered(handle: &ServerHandle, domain: &str) {
    for _ in 0..500 {
        if !handle.domain_registered(domain) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("domain {} never unregistered", domain);
}

#[derive(Clone, Copy)]
enum Behavior {
    /// Answer tickets and echo every binary frame unchanged.
    Echo,
    /// Answer tickets and echo every binary frame reversed.
    Reverse,
    /// Answer tickets but never send anything back.
    Mute,
    /// Keep the control channel open but never answer tickets.
    Ignore,
}

/// Connect a control channel for `domain` and serve tickets according to
/// `behavior`. Aborting the returned task tears the agent down without a
/// goodbye, like a crashed process.
async fn spawn_agent(
    manager: SocketAddr,
    domain: &'static str,
    behavior: Behavior,
) -> tokio::task::JoinHandle<()> {
    let mut control = connect_control(manager, domain).await;
    tokio::spawn(async move {
        while let Some(Ok(message)) = control.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(notice) = serde_json::from_str::<TicketNotice>(&text) else {
                continue;
            };
            if matches!(behavior, Behavior::Ignore) {
                continue;
            }
            let url = format!("ws://{}/ws/{}/{}", manager, domain, notice.uuid);
            tokio::spawn(async move {
                let (mut data, _) = connect_async(&url).await.expect("data upgrade");
                match behavior {
                    Behavior::Mute => {
                        // hold the socket open without answering
                        while let Some(Ok(_)) = data.next().await {}
                    }
                    _ => {
                        while let Some(Ok(message)) = data.next().await {
                            if let Message::Binary(mut payload) = message {
                                if matches!(behavior, Behavior::Reverse) {
                                    payload.reverse();
                                }
                                if data.send(Message::Binary(payload)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            });
        }
    })
}

async fn next_ticket(control: &mut Ws) -> String {
    loop {
        let message = timeout(WAIT, control.next())
            .await
            .expect("ticket in time")
            .expect("control open")
            .expect("control healthy");
        if let Message::Text(text) = message {
            let notice: TicketNotice = serde_json::from_str(&text).expect("valid notice");
            return notice.uuid;
        }
    }
}

#[tokio::test]
async fn test_round_trip_through_agent() {
    let handle = start_server().await;
    let _agent = spawn_agent(handle.manager_addr, "a.test", Behavior::Reverse).await;
    wait_registered(&handle, "a.test").await;

    let request = b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n";
    let mut expected = request.to_vec();
    expected.reverse();

    let mut client = TcpStream::connect(handle.proxy_addr).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut response = vec![0u8; expected.len()];
    timeout(WAIT, client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, expected);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_domain_gets_502() {
    let handle = start_server().await;

    let mut client = TcpStream::connect(handle.proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: b.test\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(WAIT, client.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 502"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_vanished_agent_gets_502() {
    let handle = start_server().await;
    let agent = spawn_agent(handle.manager_addr, "c.test", Behavior::Echo).await;
    wait_registered(&handle, "c.test").await;

    // the agent dies without a goodbye
    agent.abort();
    wait_unregistered(&handle, "c.test").await;

    let mut client = TcpStream::connect(handle.proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: c.test\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(WAIT, client.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 502"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let handle = start_server().await;
    let _agent = spawn_agent(handle.manager_addr, "d.test", Behavior::Echo).await;
    wait_registered(&handle, "d.test").await;

    // default policy forbids a second control socket for the same domain
    let err = connect_async(format!("ws://{}/ws/d.test", handle.manager_addr))
        .await
        .err()
        .expect("second registration should be refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 409);
        }
        other => panic!("expected http refusal, got {:?}", other),
    }

    // the first registration keeps working
    let mut client = TcpStream::connect(handle.proxy_addr).await.unwrap();
    let request = b"GET / HTTP/1.1\r\nHost: d.test\r\n\r\n";
    client.write_all(request).await.unwrap();

    let mut response = vec![0u8; request.len()];
    timeout(WAIT, client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, request);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_ten_concurrent_clients_and_traffic_meter() {
    let handle = start_server().await;
    let _agent = spawn_agent(handle.manager_addr, "e.test", Behavior::Echo).await;
    wait_registered(&handle, "e.test").await;

    let request = format!("GET /{} HTTP/1.1\r\nHost: e.test\r\n\r\n", "x".repeat(64));
    let payload_len = request.len();

    let mut clients = Vec::new();
    for _ in 0..10 {
        let addr = handle.proxy_addr;
        let request = request.clone();
        clients.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(request.as_bytes()).await.unwrap();

            let mut response = vec![0u8; request.len()];
            timeout(WAIT, client.read_exact(&mut response))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(response.as_slice(), request.as_bytes());
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    // every splice counts both directions
    let expected = (20 * payload_len) as u64;
    for _ in 0..100 {
        if handle.traffic_total() == expected {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.traffic_total(), expected);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_mid_splice_closes_both_endpoints() {
    let handle = start_server().await;
    let _agent = spawn_agent(handle.manager_addr, "f.test", Behavior::Mute).await;
    wait_registered(&handle, "f.test").await;

    let mut client = TcpStream::connect(handle.proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: f.test\r\n\r\n")
        .await
        .unwrap();

    // give the splice a moment to come up, then pull the plug
    sleep(Duration::from_millis(200)).await;
    timeout(Duration::from_secs(6), handle.shutdown())
        .await
        .expect("shutdown should complete within the grace period");

    let mut buf = [0u8; 16];
    match timeout(Duration::from_secs(6), client.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("unexpected {} bytes after shutdown", n),
        Err(_) => panic!("client endpoint still open after shutdown"),
    }
}

#[tokio::test]
async fn test_ticket_expiry_yields_502() {
    let mut config = ServerConfig::default();
    config.tunnel.ticket_timeout_secs = 1;
    let handle = start_server_with(config).await;

    let _agent = spawn_agent(handle.manager_addr, "g.test", Behavior::Ignore).await;
    wait_registered(&handle, "g.test").await;

    let mut client = TcpStream::connect(handle.proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: g.test\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(WAIT, client.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 502"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_second_data_socket_for_same_ticket_is_closed() {
    let handle = start_server().await;
    let mut control = connect_control(handle.manager_addr, "h.test").await;
    wait_registered(&handle, "h.test").await;

    let mut client = TcpStream::connect(handle.proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: h.test\r\n\r\n")
        .await
        .unwrap();

    let ticket = next_ticket(&mut control).await;
    let url = format!("ws://{}/ws/h.test/{}", handle.manager_addr, ticket);

    // the first answer receives the client's bytes
    let (mut first, _) = connect_async(&url).await.unwrap();
    let frame = timeout(WAIT, first.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(frame, Message::Binary(_)));

    // a second answer for a consumed ticket is turned away
    let (mut second, _) = connect_async(&url).await.unwrap();
    match timeout(WAIT, second.next()).await.unwrap() {
        None | Some(Ok(Message::Close(_))) => {}
        other => panic!("expected close for duplicate ticket, got {:?}", other),
    }

    // the first splice is unaffected
    first
        .send(Message::Binary(b"pong".to_vec()))
        .await
        .unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"pong");

    handle.shutdown().await;
}

#[tokio::test]
async fn test_data_socket_with_forged_ticket_is_closed() {
    let handle = start_server().await;
    let _control = connect_control(handle.manager_addr, "i.test").await;
    wait_registered(&handle, "i.test").await;

    let url = format!("ws://{}/ws/i.test/no-such-ticket", handle.manager_addr);
    let (mut socket, _) = connect_async(&url).await.unwrap();
    match timeout(WAIT, socket.next()).await.unwrap() {
        None | Some(Ok(Message::Close(_))) => {}
        other => panic!("expected close for forged ticket, got {:?}", other),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_missing_host_gets_502() {
    let handle = start_server().await;

    let mut client = TcpStream::connect(handle.proxy_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(WAIT, client.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 502"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_allow_multiple_round_robins_tickets() {
    let mut config = ServerConfig::default();
    config.auth.tokens = vec![backhaul_server::auth::TokenEntry {
        token: "shared".to_string(),
        allow_multiple: true,
        domains: Vec::new(),
    }];
    let handle = start_server_with(config).await;

    let mut first = connect_control_with_token(handle.manager_addr, "j.test", "shared").await;
    wait_registered(&handle, "j.test").await;
    let mut second = connect_control_with_token(handle.manager_addr, "j.test", "shared").await;
    // the second socket has no registration milestone to wait on; a ticket
    // reaching it is the observable effect
    sleep(Duration::from_millis(100)).await;

    let mut clients = Vec::new();
    for _ in 0..2 {
        let mut client = TcpStream::connect(handle.proxy_addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: j.test\r\n\r\n")
            .await
            .unwrap();
        clients.push(client);
    }

    // one ticket lands on each control socket
    let _ = next_ticket(&mut first).await;
    let _ = next_ticket(&mut second).await;

    handle.shutdown().await;
}

async fn connect_control_with_token(manager: SocketAddr, domain: &str, token: &str) -> Ws {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = format!("ws://{}/ws/{}", manager, domain)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", token).parse().unwrap(),
    );
    let (socket, _) = connect_async(request)
        .await
        .expect("control upgrade should succeed");
    socket
}
