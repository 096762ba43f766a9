//! DNS pseudo-outbound: reads DNS framing from an inbound connection and
//! answers through the router's exchange. Each query runs as its own task;
//! the group shares a renewable idle timer and keeps the first error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapter::{
    CachedPacket, DispatchContext, DnsExchanger, InboundContext, Outbound, PacketConn, StreamConn,
};
use crate::constant;
use crate::error::{Error, Result};
use crate::types::{Destination, Network};

/// Captures the cause of the first cancellation in a query group.
#[derive(Clone)]
struct FirstError {
    inner: Arc<Mutex<Option<Error>>>,
    token: CancellationToken,
}

impl FirstError {
    fn new(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            token,
        }
    }

    fn capture(&self, err: Error) {
        {
            let mut slot = self.inner.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.token.cancel();
    }

    fn take(&self) -> Option<Error> {
        self.inner.lock().take()
    }
}

/// Renewable deadline: cancels the token when no message arrived for the
/// configured window.
#[derive(Clone)]
struct IdleTimer {
    last: Arc<Mutex<tokio::time::Instant>>,
}

impl IdleTimer {
    fn start(token: CancellationToken, timeout: Duration) -> Self {
        let last = Arc::new(Mutex::new(tokio::time::Instant::now()));
        let timer = Self { last: last.clone() };
        tokio::spawn(async move {
            loop {
                let deadline = *last.lock() + timeout;
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {
                        if tokio::time::Instant::now() >= *last.lock() + timeout {
                            token.cancel();
                            return;
                        }
                    }
                }
            }
        });
        timer
    }

    fn update(&self) {
        *self.last.lock() = tokio::time::Instant::now();
    }
}

pub struct DnsOutbound {
    tag: String,
    exchanger: Arc<dyn DnsExchanger>,
    networks: [Network; 2],
}

impl DnsOutbound {
    pub fn new(tag: impl Into<String>, exchanger: Arc<dyn DnsExchanger>) -> Self {
        Self {
            tag: tag.into(),
            exchanger,
            networks: [Network::Tcp, Network::Udp],
        }
    }
}

#[async_trait]
impl Outbound for DnsOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> &str {
        constant::TYPE_DNS
    }

    fn network(&self) -> &[Network] {
        &self.networks
    }

    async fn new_connection(
        &self,
        ctx: DispatchContext,
        conn: Box<dyn StreamConn>,
        metadata: InboundContext,
    ) -> Result<()> {
        let token = ctx.cancel.child_token();
        let first_error = FirstError::new(token.clone());
        let timer = IdleTimer::start(token.clone(), constant::DNS_TIMEOUT);

        let (mut read_half, write_half) = tokio::io::split(conn);
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        let mut queries: JoinSet<()> = JoinSet::new();

        loop {
            let mut length_buf = [0u8; 2];
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = read_half.read_exact(&mut length_buf) => read,
            };
            if let Err(err) = read {
                first_error.capture(Error::Io(err));
                break;
            }
            let length = u16::from_be_bytes(length_buf) as usize;
            if length == 0 {
                first_error.capture(Error::Rcode(ResponseCode::FormErr));
                break;
            }
            let mut payload = vec![0u8; length];
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = read_half.read_exact(&mut payload) => read,
            };
            if let Err(err) = read {
                first_error.capture(Error::Io(err));
                break;
            }
            let message = match Message::from_bytes(&payload) {
                Ok(message) => message,
                Err(err) => {
                    first_error.capture(Error::Proto(err));
                    break;
                }
            };
            timer.update();

            let exchanger = self.exchanger.clone();
            let query_ctx = DispatchContext {
                cancel: token.clone(),
                outbound_tag: ctx.outbound_tag.clone(),
            };
            let mut query_metadata = metadata.clone();
            let writer = writer.clone();
            let errors = first_error.clone();
            let timer = timer.clone();
            queries.spawn(async move {
                let response = match exchanger
                    .exchange(&query_ctx, &mut query_metadata, &message)
                    .await
                {
                    Ok(response) => response,
                    Err(err) => {
                        errors.capture(err);
                        return;
                    }
                };
                timer.update();
                let encoded = match response.to_bytes() {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        errors.capture(Error::Proto(err));
                        return;
                    }
                };
                let mut framed = Vec::with_capacity(2 + encoded.len());
                framed.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
                framed.extend_from_slice(&encoded);
                // Writes from concurrent queries are serialized here.
                let mut writer = writer.lock().await;
                if let Err(err) = writer.write_all(&framed).await {
                    errors.capture(Error::Io(err));
                }
            });
        }

        token.cancel();
        while queries.join_next().await.is_some() {}
        match first_error.take() {
            Some(err) if err.is_closed() => {
                debug!("dns stream finished: {}", err);
                Ok(())
            }
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn new_packet_connection(
        &self,
        ctx: DispatchContext,
        conn: Arc<dyn PacketConn>,
        metadata: InboundContext,
    ) -> Result<()> {
        let token = ctx.cancel.child_token();
        let first_error = FirstError::new(token.clone());
        let timer = IdleTimer::start(token.clone(), constant::DNS_TIMEOUT);
        let mut queries: JoinSet<()> = JoinSet::new();

        // Replay anything the sniffer already pulled off the socket.
        let mut cached: Vec<CachedPacket> = Vec::new();
        while let Some(packet) = conn.read_cached_packet() {
            cached.push(packet);
        }
        let mut cached = cached.into_iter();

        let mut buffer = vec![0u8; 4096];
        loop {
            let (payload, destination): (Vec<u8>, Destination) = match cached.next() {
                Some(packet) => (packet.payload, packet.destination),
                None => {
                    let read = tokio::select! {
                        _ = token.cancelled() => break,
                        read = conn.read_packet(&mut buffer) => read,
                    };
                    match read {
                        Ok((n, destination)) => {
                            timer.update();
                            (buffer[..n].to_vec(), destination)
                        }
                        Err(err) => {
                            first_error.capture(err);
                            break;
                        }
                    }
                }
            };
            let message = match Message::from_bytes(&payload) {
                Ok(message) => message,
                Err(err) => {
                    first_error.capture(Error::Proto(err));
                    break;
                }
            };

            let exchanger = self.exchanger.clone();
            let query_ctx = DispatchContext {
                cancel: token.clone(),
                outbound_tag: ctx.outbound_tag.clone(),
            };
            let mut query_metadata = metadata.clone();
            let conn = conn.clone();
            let errors = first_error.clone();
            let timer = timer.clone();
            queries.spawn(async move {
                let response = match exchanger
                    .exchange(&query_ctx, &mut query_metadata, &message)
                    .await
                {
                    Ok(response) => response,
                    Err(err) => {
                        errors.capture(err);
                        return;
                    }
                };
                timer.update();
                let encoded = match crate::dns::truncate_message(&response, constant::DNS_PACKET_MTU)
                {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        errors.capture(err);
                        return;
                    }
                };
                if let Err(err) = conn.write_packet(&encoded, &destination).await {
                    errors.capture(err);
                }
            });
        }

        token.cancel();
        while queries.join_next().await.is_some() {}
        let _ = conn.close().await;
        match first_error.take() {
            Some(err) if err.is_closed() => {
                debug!("dns packet conn finished: {}", err);
                Ok(())
            }
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
