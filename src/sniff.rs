//! Payload sniffing: peek a small prefix of a connection to infer the
//! application protocol and host. Peeked bytes are always preserved and
//! replayed to the outbound through a cached connection.

use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::adapter::InboundContext;
use crate::dns::question_domain;

/// Outcome of one sniffer over the bytes seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffOutcome {
    /// Context fields were filled.
    Matched,
    /// Could match with more bytes of the same stream/datagram.
    NeedMoreData,
    /// A multi-datagram handshake was detected; retry with the next packet.
    Fragmented,
    NotMatched,
}

pub type Sniffer = fn(&mut InboundContext, &[u8]) -> SniffOutcome;

pub fn default_stream_sniffers() -> Vec<Sniffer> {
    vec![sniff_stream_dns, sniff_tls_client_hello, sniff_http_host]
}

pub fn default_packet_sniffers() -> Vec<Sniffer> {
    vec![sniff_packet_dns, sniff_quic, sniff_stun]
}

/// Sniffers used when retrying a fragmented QUIC hello on the next packet.
pub fn packet_retry_sniffers() -> Vec<Sniffer> {
    vec![sniff_quic]
}

/// Read from the connection until a sniffer matches, all reject, or the
/// timeout fires. Returns every byte read so the caller can replay them.
pub async fn peek_stream<R: AsyncRead + Unpin>(
    conn: &mut R,
    ctx: &mut InboundContext,
    sniffers: &[Sniffer],
    timeout: Duration,
) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(2048);
    let mut chunk = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let read = tokio::time::timeout_at(deadline, conn.read(&mut chunk)).await;
        let n = match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                if buffer.is_empty() {
                    return Err(err);
                }
                break;
            }
            // Timed out: sniffing is best-effort.
            Err(_) => break,
        };
        buffer.extend_from_slice(&chunk[..n]);
        match run_sniffers(ctx, &buffer, sniffers) {
            SniffOutcome::Matched => break,
            SniffOutcome::NeedMoreData => continue,
            _ => break,
        }
    }
    Ok(buffer)
}

/// Run sniffers over one datagram.
pub fn sniff_packet(ctx: &mut InboundContext, payload: &[u8], sniffers: &[Sniffer]) -> SniffOutcome {
    run_sniffers(ctx, payload, sniffers)
}

fn run_sniffers(ctx: &mut InboundContext, data: &[u8], sniffers: &[Sniffer]) -> SniffOutcome {
    let mut outcome = SniffOutcome::NotMatched;
    for sniffer in sniffers {
        match sniffer(ctx, data) {
            SniffOutcome::Matched => return SniffOutcome::Matched,
            SniffOutcome::NeedMoreData => outcome = SniffOutcome::NeedMoreData,
            SniffOutcome::Fragmented => {
                if outcome == SniffOutcome::NotMatched {
                    outcome = SniffOutcome::Fragmented;
                }
            }
            SniffOutcome::NotMatched => {}
        }
    }
    outcome
}

/// TLS ClientHello with SNI.
pub fn sniff_tls_client_hello(ctx: &mut InboundContext, data: &[u8]) -> SniffOutcome {
    if data.len() < 5 {
        return SniffOutcome::NeedMoreData;
    }
    // Handshake record, TLS 1.x.
    if data[0] != 0x16 || data[1] != 0x03 {
        return SniffOutcome::NotMatched;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if data.len() < 5 + record_len {
        return SniffOutcome::NeedMoreData;
    }
    let handshake = &data[5..5 + record_len];
    if handshake.len() < 4 || handshake[0] != 0x01 {
        return SniffOutcome::NotMatched;
    }
    let body_len =
        ((handshake[1] as usize) << 16) | ((handshake[2] as usize) << 8) | handshake[3] as usize;
    if handshake.len() < 4 + body_len {
        return SniffOutcome::NeedMoreData;
    }
    let body = &handshake[4..4 + body_len];
    let mut offset = 0usize;

    // Legacy version + random.
    if body.len() < offset + 34 {
        return SniffOutcome::NotMatched;
    }
    offset += 34;
    // Session id.
    let Some(session_len) = body.get(offset).copied() else {
        return SniffOutcome::NotMatched;
    };
    offset += 1 + session_len as usize;
    // Cipher suites.
    if body.len() < offset + 2 {
        return SniffOutcome::NotMatched;
    }
    let ciphers_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
    offset += 2 + ciphers_len;
    // Compression methods.
    let Some(compression_len) = body.get(offset).copied() else {
        return SniffOutcome::NotMatched;
    };
    offset += 1 + compression_len as usize;

    ctx.protocol = Some("tls".to_string());
    if body.len() < offset + 2 {
        return SniffOutcome::Matched;
    }
    let extensions_len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
    offset += 2;
    let Some(mut extensions) = body.get(offset..offset + extensions_len) else {
        return SniffOutcome::Matched;
    };
    while extensions.len() >= 4 {
        let ext_type = u16::from_be_bytes([extensions[0], extensions[1]]);
        let ext_len = u16::from_be_bytes([extensions[2], extensions[3]]) as usize;
        let Some(ext_body) = extensions.get(4..4 + ext_len) else {
            break;
        };
        if ext_type == 0 && ext_body.len() >= 5 {
            // server_name list: entry type 0 is host_name.
            let name_len = u16::from_be_bytes([ext_body[3], ext_body[4]]) as usize;
            if ext_body[2] == 0 {
                if let Some(name) = ext_body.get(5..5 + name_len) {
                    if let Ok(host) = std::str::from_utf8(name) {
                        ctx.sniff_host = Some(host.to_lowercase());
                    }
                }
            }
            break;
        }
        extensions = &extensions[4 + ext_len..];
    }
    SniffOutcome::Matched
}

const HTTP_METHODS: &[&str] = &[
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE ",
];

/// Plain HTTP request with a Host header.
pub fn sniff_http_host(ctx: &mut InboundContext, data: &[u8]) -> SniffOutcome {
    let prefix_len = data.len().min(8);
    let Ok(prefix) = std::str::from_utf8(&data[..prefix_len]) else {
        return SniffOutcome::NotMatched;
    };
    if !HTTP_METHODS
        .iter()
        .any(|method| prefix.starts_with(method) || method.starts_with(prefix))
    {
        return SniffOutcome::NotMatched;
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return SniffOutcome::NeedMoreData;
    };
    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("host") {
                let host = value.trim().to_lowercase();
                // Strip any port suffix; IPv6 literals keep their brackets.
                let host = match host.rsplit_once(':') {
                    Some((bare, port)) if port.parse::<u16>().is_ok() && !bare.contains(':') => {
                        bare.to_string()
                    }
                    _ => host,
                };
                ctx.protocol = Some("http".to_string());
                ctx.sniff_host = Some(host);
                return SniffOutcome::Matched;
            }
        }
    }
    if text.contains("\r\n\r\n") {
        return SniffOutcome::NotMatched;
    }
    SniffOutcome::NeedMoreData
}

/// Length-framed DNS query on a byte stream.
pub fn sniff_stream_dns(ctx: &mut InboundContext, data: &[u8]) -> SniffOutcome {
    if data.len() < 2 {
        return SniffOutcome::NeedMoreData;
    }
    let length = u16::from_be_bytes([data[0], data[1]]) as usize;
    if length == 0 {
        return SniffOutcome::NotMatched;
    }
    match data.get(2..2 + length) {
        Some(payload) => sniff_dns_payload(ctx, payload),
        None => SniffOutcome::NeedMoreData,
    }
}

/// One datagram carrying a DNS query.
pub fn sniff_packet_dns(ctx: &mut InboundContext, data: &[u8]) -> SniffOutcome {
    sniff_dns_payload(ctx, data)
}

fn sniff_dns_payload(ctx: &mut InboundContext, payload: &[u8]) -> SniffOutcome {
    let Ok(message) = Message::from_bytes(payload) else {
        return SniffOutcome::NotMatched;
    };
    if message.queries().is_empty() {
        return SniffOutcome::NotMatched;
    }
    ctx.protocol = Some("dns".to_string());
    ctx.domain = question_domain(&message);
    SniffOutcome::Matched
}

/// QUIC long-header initial packet. Host extraction would require
/// decrypting the initial secrets, so only the protocol is recorded; a
/// coalesced hello spanning datagrams reports `Fragmented`.
pub fn sniff_quic(ctx: &mut InboundContext, data: &[u8]) -> SniffOutcome {
    if data.len() < 6 {
        return SniffOutcome::NotMatched;
    }
    // Long header with fixed bit, packet type Initial.
    if data[0] & 0xc0 != 0xc0 || data[0] & 0x30 != 0x00 {
        return SniffOutcome::NotMatched;
    }
    let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    if version != 1 && version != 0x6b33_43cf {
        return SniffOutcome::NotMatched;
    }
    // An initial packet padded to less than the minimum datagram size is a
    // fragment of a coalesced hello.
    if data.len() < 1200 {
        ctx.protocol = Some("quic".to_string());
        return SniffOutcome::Fragmented;
    }
    ctx.protocol = Some("quic".to_string());
    SniffOutcome::Matched
}

/// STUN binding message (WebRTC and NAT probes).
pub fn sniff_stun(ctx: &mut InboundContext, data: &[u8]) -> SniffOutcome {
    if data.len() < 20 {
        return SniffOutcome::NotMatched;
    }
    if data[0] & 0xc0 != 0 {
        return SniffOutcome::NotMatched;
    }
    if data[4..8] != [0x21, 0x12, 0xa4, 0x42] {
        return SniffOutcome::NotMatched;
    }
    ctx.protocol = Some("stun".to_string());
    SniffOutcome::Matched
}

/// Build a minimal TLS ClientHello carrying the given SNI; shared by the
/// sniffer and router tests.
#[cfg(test)]
pub(crate) fn test_client_hello(sni: &str) -> Vec<u8> {
    let name = sni.as_bytes();
    // server_name extension body.
    let mut ext_body = Vec::new();
    ext_body.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    ext_body.push(0);
    ext_body.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext_body.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes());
    extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&ext_body);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0); // session id
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]); // one cipher suite
    body.push(1);
    body.push(0); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.push(0);
    handshake.extend_from_slice(&(body.len() as u16).to_be_bytes());
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
