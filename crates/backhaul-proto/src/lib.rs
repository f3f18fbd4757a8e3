//! Wire-level contract between the backhaul server and its agents
//!
//! The control channel carries one message kind, server to agent: a JSON
//! text frame naming the ticket a fresh data channel should answer. Data
//! channels carry raw binary frames and have no messages of their own.

use serde::{Deserialize, Serialize};

/// Ticket announcement sent on the control channel.
///
/// The agent answers by opening a WebSocket at [`data_path`] for the
/// same ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketNotice {
    pub uuid: String,
}

/// Path of the long-lived control endpoint for a domain.
pub fn control_path(domain: &str) -> String {
    format!("/ws/{}", domain)
}

/// Path of the data endpoint answering a ticket.
pub fn data_path(domain: &str, ticket: &str) -> String {
    format!("/ws/{}/{}", domain, ticket)
}

/// A parsed upgrade-endpoint path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsPath {
    /// `/ws/{domain}` - the agent's control channel.
    Control { domain: String },
    /// `/ws/{domain}/{ticket}` - a data channel answering a ticket.
    Data { domain: String, ticket: String },
}

impl WsPath {
    /// Parse an upgrade request path. Domains are compared
    /// case-insensitively everywhere, so the domain segment is lowercased
    /// here once.
    pub fn parse(path: &str) -> Option<Self> {
        let mut segments = path.trim_matches('/').split('/');
        if segments.next() != Some("ws") {
            return None;
        }
        let domain = match segments.next() {
            Some(d) if !d.is_empty() => d.to_ascii_lowercase(),
            _ => return None,
        };
        match segments.next() {
            None => Some(WsPath::Control { domain }),
            Some(t) if !t.is_empty() && segments.next().is_none() => Some(WsPath::Data {
                domain,
                ticket: t.to_string(),
            }),
            _ => None,
        }
    }
}
