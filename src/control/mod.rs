//! Control channel: length-prefixed framed commands driving the router
//! from an external client. Integers are big-endian; strings are
//! u16-length-prefixed UTF-8.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::adapter::CacheFile;
use crate::error::{Error, Result};
use crate::router::Router;
use crate::urltest::HistoryStorage;

pub const COMMAND_HEALTH_CHECK: u8 = 10;
pub const COMMAND_PROVIDER_EXPAND: u8 = 11;
pub const COMMAND_PROVIDER_LIST: u8 = 12;

pub async fn write_varstr<W: AsyncWrite + Unpin>(writer: &mut W, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > usize::from(u16::MAX) {
        return Err(Error::Config("string too long for frame".to_string()));
    }
    writer.write_u16(bytes.len() as u16).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

pub async fn read_varstr<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let length = reader.read_u16().await?;
    let mut buffer = vec![0u8; usize::from(length)];
    reader.read_exact(&mut buffer).await?;
    String::from_utf8(buffer).map_err(|err| Error::Config(err.to_string()))
}

/// `u8 hasError` then the message when set.
pub async fn write_error_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    error: Option<&str>,
) -> Result<()> {
    match error {
        Some(message) => {
            writer.write_u8(1).await?;
            write_varstr(writer, message).await?;
        }
        None => writer.write_u8(0).await?,
    }
    writer.flush().await?;
    Ok(())
}

pub async fn read_error_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let has_error = reader.read_u8().await?;
    if has_error == 0 {
        return Ok(());
    }
    let message = read_varstr(reader).await?;
    Err(Error::Config(message))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderItem {
    pub tag: String,
    pub item_type: String,
    pub url_test_time: i64,
    pub url_test_delay: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderEntry {
    pub tag: String,
    pub provider_type: String,
    pub is_expand: bool,
    pub items: Vec<ProviderItem>,
}

pub struct CommandServer {
    router: Arc<Router>,
    history: Arc<HistoryStorage>,
    cache_file: Option<Arc<dyn CacheFile>>,
}

impl CommandServer {
    pub fn new(
        router: Arc<Router>,
        history: Arc<HistoryStorage>,
        cache_file: Option<Arc<dyn CacheFile>>,
    ) -> Self {
        Self {
            router,
            history,
            cache_file,
        }
    }

    /// Serve one framed command connection.
    pub async fn serve_connection<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut conn: S,
    ) -> Result<()> {
        let opcode = conn.read_u8().await?;
        match opcode {
            COMMAND_HEALTH_CHECK => self.handle_health_check(&mut conn).await,
            COMMAND_PROVIDER_EXPAND => self.handle_provider_expand(&mut conn).await,
            COMMAND_PROVIDER_LIST => self.handle_provider_list(&mut conn).await,
            other => Err(Error::Config(format!("unknown command: {}", other))),
        }
    }

    async fn handle_health_check<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        conn: &mut S,
    ) -> Result<()> {
        let provider_tag = read_varstr(conn).await?;
        match self.router.outbound_provider(&provider_tag) {
            Some(provider) => {
                // The URL test runs asynchronously; the frame only
                // acknowledges the trigger.
                tokio::spawn(async move {
                    provider.check_outbounds(true).await;
                });
                write_error_frame(conn, None).await
            }
            None => {
                let message = Error::OutboundProviderNotFound(provider_tag).to_string();
                write_error_frame(conn, Some(&message)).await
            }
        }
    }

    async fn handle_provider_expand<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        conn: &mut S,
    ) -> Result<()> {
        let provider_tag = read_varstr(conn).await?;
        let is_expand = conn.read_u8().await? != 0;
        if let Some(cache_file) = &self.cache_file {
            if let Err(err) = cache_file.store_provider_expand(&provider_tag, is_expand) {
                return write_error_frame(conn, Some(&err.to_string())).await;
            }
        }
        write_error_frame(conn, None).await
    }

    async fn handle_provider_list<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        conn: &mut S,
    ) -> Result<()> {
        let interval_nanos = conn.read_i64().await?;
        let interval = Duration::from_nanos(interval_nanos.max(0) as u64);
        let mut updates = self.history.subscribe();
        loop {
            self.write_providers(conn).await?;
            // A new frame requires both the client-chosen tick and a URL
            // test update.
            tokio::time::sleep(interval).await;
            match updates.recv().await {
                Ok(()) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("url-test update channel closed");
                    return Ok(());
                }
            }
        }
    }

    async fn write_providers<S: AsyncWrite + Unpin>(&self, conn: &mut S) -> Result<()> {
        let providers = self.router.outbound_providers();
        conn.write_u16(providers.len() as u16).await?;
        for provider in providers {
            write_varstr(conn, provider.tag()).await?;
            write_varstr(conn, provider.provider_type()).await?;
            let is_expand = self
                .cache_file
                .as_ref()
                .and_then(|cache_file| cache_file.load_provider_expand(provider.tag()))
                .unwrap_or(false);
            conn.write_u8(u8::from(is_expand)).await?;
            let outbounds = provider.outbounds();
            conn.write_u16(outbounds.len() as u16).await?;
            for outbound in outbounds {
                write_varstr(conn, outbound.tag()).await?;
                write_varstr(conn, outbound.outbound_type()).await?;
                let history = self.history.load(outbound.tag()).unwrap_or_default();
                conn.write_i64(history.time).await?;
                conn.write_i32(history.delay as i32).await?;
            }
        }
        conn.flush().await?;
        Ok(())
    }
}

// Client-side counterparts.

pub async fn health_check<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut S,
    provider_tag: &str,
) -> Result<()> {
    conn.write_u8(COMMAND_HEALTH_CHECK).await?;
    write_varstr(conn, provider_tag).await?;
    conn.flush().await?;
    read_error_frame(conn).await
}

pub async fn set_provider_expand<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut S,
    provider_tag: &str,
    is_expand: bool,
) -> Result<()> {
    conn.write_u8(COMMAND_PROVIDER_EXPAND).await?;
    write_varstr(conn, provider_tag).await?;
    conn.write_u8(u8::from(is_expand)).await?;
    conn.flush().await?;
    read_error_frame(conn).await
}

/// Open the provider stream: later frames are read with `read_providers`.
pub async fn request_provider_list<S: AsyncWrite + Unpin>(
    conn: &mut S,
    interval: Duration,
) -> Result<()> {
    conn.write_u8(COMMAND_PROVIDER_LIST).await?;
    conn.write_i64(interval.as_nanos() as i64).await?;
    conn.flush().await?;
    Ok(())
}

pub async fn read_providers<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<ProviderEntry>> {
    let count = reader.read_u16().await?;
    let mut providers = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let tag = read_varstr(reader).await?;
        let provider_type = read_varstr(reader).await?;
        let is_expand = reader.read_u8().await? != 0;
        let item_count = reader.read_u16().await?;
        let mut items = Vec::with_capacity(usize::from(item_count));
        for _ in 0..item_count {
            items.push(ProviderItem {
                tag: read_varstr(reader).await?,
                item_type: read_varstr(reader).await?,
                url_test_time: reader.read_i64().await?,
                url_test_delay: reader.read_i32().await?,
            });
        }
        providers.push(ProviderEntry {
            tag,
            provider_type,
            is_expand,
            items,
        });
    }
    Ok(providers)
}
