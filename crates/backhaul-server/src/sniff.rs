//! Host extraction for public connections
//!
//! Public connections are routed by destination domain before any bytes are
//! consumed. For cleartext HTTP/1.x the domain comes from the `Host` header;
//! for TLS it comes from the SNI extension of the ClientHello. Everything
//! read while sniffing is handed back so the caller can wrap the connection
//! in a [`PrefixedStream`](crate::stream::PrefixedStream) and replay it.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// How many header bytes an HTTP request may spend before naming a host.
pub const HEADER_CAP: usize = 8 * 1024;

/// Upper bound on the first TLS record (RFC 8446 record size plus header).
const TLS_RECORD_CAP: usize = 16_384 + 5;

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before a host could be determined")]
    Truncated,

    #[error("no host header in the first {HEADER_CAP} bytes")]
    HostMissing,

    #[error("client hello carries no server name")]
    SniMissing,

    #[error("malformed tls record")]
    BadTlsRecord,
}

/// Read just enough of the connection to name its destination domain.
///
/// Returns the lowercased domain (port stripped) together with every byte
/// that was consumed, in order.
pub async fn peek_domain<S>(stream: &mut S) -> Result<(String, Bytes), SniffError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    read_some(stream, &mut buf).await?;

    let domain = if buf[0] == 0x16 {
        let record = read_tls_record(stream, &mut buf).await?;
        extract_sni(record).ok_or(SniffError::SniMissing)?
    } else {
        read_http_headers(stream, &mut buf).await?;
        extract_host(&buf).ok_or(SniffError::HostMissing)?
    };

    Ok((domain, buf.freeze()))
}

async fn read_some<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<(), SniffError> {
    if stream.read_buf(buf).await? == 0 {
        return Err(SniffError::Truncated);
    }
    Ok(())
}

/// Accumulate the full first TLS record and return it.
async fn read_tls_record<'a, S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &'a mut BytesMut,
) -> Result<&'a [u8], SniffError> {
    while buf.len() < 5 {
        read_some(stream, buf).await?;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let total = 5 + record_len;
    if total > TLS_RECORD_CAP {
        return Err(SniffError::BadTlsRecord);
    }
    while buf.len() < total {
        read_some(stream, buf).await?;
    }
    Ok(&buf[..total])
}

/// Accumulate HTTP bytes until the header block ends or the cap is hit.
async fn read_http_headers<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<(), SniffError> {
    loop {
        if find_headers_end(buf).is_some() {
            return Ok(());
        }
        if buf.len() >= HEADER_CAP {
            return Err(SniffError::HostMissing);
        }
        read_some(stream, buf).await?;
    }
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Pull the `Host` header out of an HTTP/1.x header block.
///
/// The match is case-insensitive, the value is lowercased and any port
/// suffix is dropped. Bracketed IPv6 literals keep their brackets.
fn extract_host(data: &[u8]) -> Option<String> {
    let head = std::str::from_utf8(&data[..find_headers_end(data)?]).ok()?;

    for line in head.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("host") {
            let host = value.trim();
            let host = if host.starts_with('[') {
                // [::1]:8080 keeps the bracketed literal
                &host[..host.find(']').map(|i| i + 1)?]
            } else {
                host.split(':').next()?
            };
            if host.is_empty() {
                return None;
            }
            return Some(host.to_ascii_lowercase());
        }
    }
    None
}

/// Pull the SNI host name out of the first record of a TLS ClientHello.
fn extract_sni(record: &[u8]) -> Option<String> {
    // content type must be handshake, message type ClientHello
    if record.len() < 43 || record[0] != 0x16 || record[5] != 0x01 {
        return None;
    }

    // record header (5) + handshake header (4) + version (2) + random (32)
    let mut at = 43;

    let session_id_len = *record.get(at)? as usize;
    at += 1 + session_id_len;

    let cipher_suites_len = read_u16(record, at)? as usize;
    at += 2 + cipher_suites_len;

    let compression_len = *record.get(at)? as usize;
    at += 1 + compression_len;

    let extensions_len = read_u16(record, at)? as usize;
    at += 2;
    let extensions_end = at.checked_add(extensions_len)?;
    if extensions_end > record.len() {
        return None;
    }

    while at + 4 <= extensions_end {
        let ext_type = read_u16(record, at)?;
        let ext_len = read_u16(record, at + 2)? as usize;
        at += 4;
        if ext_type == 0 {
            return parse_server_name(record.get(at..at + ext_len)?);
        }
        at += ext_len;
    }
    None
}

/// Decode the server_name extension body: a one-entry list of
/// (name_type, length, host_name).
fn parse_server_name(ext: &[u8]) -> Option<String> {
    // list length (2) + name type (1), which must be host_name
    if ext.len() < 5 || ext[2] != 0 {
        return None;
    }
    let name_len = read_u16(ext, 3)? as usize;
    let name = ext.get(5..5 + name_len)?;

    let host = std::str::from_utf8(name).ok()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(at)?, *data.get(at + 1)?]))
}
