use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use log::{debug, info};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::codec::{CompressionEncoding, Streaming};
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Server};

use super::chunk;
use super::{TensorChunk, TensorService, TensorServiceClient, TensorServiceServer};
use super::ORDINAL_METADATA_KEY;
use crate::config::max_message_size;
use crate::err::{PipelineError, PipelineResult};

/// Client side of the tensor stream: one cached channel to a single server.
pub struct GrpcTX {
    endpoint: String,
    chunk_size: usize,
    compress: bool,
    channel: Option<Channel>,
}

/// A streaming call already handed to the transport. The outbound frames may
/// still be in flight; `complete` waits for the response stream and decodes it.
pub struct PendingExchange {
    call: JoinHandle<Result<tonic::Response<Streaming<TensorChunk>>, tonic::Status>>,
}

impl PendingExchange {
    pub async fn complete(self) -> PipelineResult<Bytes> {
        let response = self.call.await??;
        chunk::decode(response.into_inner()).await
    }
}

impl GrpcTX {
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120); // 2 minutes

    pub fn new(host: &str, port: u16, chunk_size: usize) -> Self {
        Self {
            endpoint: format!("http://{}:{}", host, port),
            chunk_size,
            compress: false,
            channel: None,
        }
    }

    /// Compress outbound frames with zstd and accept compressed responses.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The channel connects lazily: the handshake runs inside the first call
    /// on it, after the caller has stamped the hand-off time.
    fn get_or_create_connection(&mut self) -> PipelineResult<TensorServiceClient<Channel>> {
        let channel = match self.channel.clone() {
            Some(channel) => channel,
            None => {
                let channel = Channel::from_shared(self.endpoint.clone())
                    .map_err(|e| {
                        PipelineError::Transport(tonic::Status::invalid_argument(format!(
                            "invalid endpoint {}: {}",
                            self.endpoint, e
                        )))
                    })?
                    .tcp_keepalive(Some(Self::KEEPALIVE_INTERVAL))
                    .tcp_nodelay(true) // Disable Nagle's algorithm for better latency
                    .http2_keep_alive_interval(Self::KEEPALIVE_INTERVAL)
                    .connect_lazy();
                info!("Opened channel to {}", self.endpoint);
                self.channel = Some(channel.clone());
                channel
            }
        };

        let limit = max_message_size(self.chunk_size);
        let mut client = TensorServiceClient::new(channel)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);
        if self.compress {
            client = client
                .send_compressed(CompressionEncoding::Zstd)
                .accept_compressed(CompressionEncoding::Zstd);
        }
        Ok(client)
    }

    /// Starts the bidirectional call for one payload and returns as soon as the
    /// call has been spawned onto the runtime, before the frames are on the wire.
    pub async fn open_exchange(
        &mut self,
        ordinal: u64,
        payload: Bytes,
    ) -> PipelineResult<PendingExchange> {
        let mut client = self.get_or_create_connection()?;
        let frames = chunk::encode(payload, self.chunk_size);
        debug!(
            "Request {}: streaming {} frame(s) to {}",
            ordinal,
            frames.frame_count(),
            self.endpoint
        );

        let mut request = tonic::Request::new(tokio_stream::iter(frames));
        request
            .metadata_mut()
            .insert(ORDINAL_METADATA_KEY, MetadataValue::from(ordinal));

        let call = tokio::spawn(async move { client.stream_tensor(request).await });
        Ok(PendingExchange { call })
    }

    /// Drops the cached channel after a failure that leaves it unusable, so the
    /// next request reconnects. A refused connection surfaces as `Unavailable`.
    pub fn observe_failure(&mut self, err: &PipelineError) {
        let unusable = match err {
            PipelineError::Transport(status) => status.code() == tonic::Code::Unavailable,
            _ => false,
        };
        if unusable && self.channel.take().is_some() {
            debug!("Removed failed connection to {}", self.endpoint);
        }
    }
}

/// Server side of the tensor stream, bound to a local TCP port.
pub struct GrpcRX {
    listener: TcpListener,
    local_addr: SocketAddr,
    chunk_size: usize,
}

impl GrpcRX {
    /// Binds `0.0.0.0:port`; port 0 picks a free port.
    pub async fn bind(port: u16, chunk_size: usize) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("Bound tensor stream listener on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            chunk_size,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `service` until `shutdown` resolves.
    pub async fn serve<S, F>(self, service: S, shutdown: F) -> Result<()>
    where
        S: TensorService,
        F: Future<Output = ()> + Send,
    {
        let limit = max_message_size(self.chunk_size);
        let service = TensorServiceServer::new(service)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit)
            .accept_compressed(CompressionEncoding::Zstd)
            .send_compressed(CompressionEncoding::Zstd);

        info!("Tensor stream server listening on {}", self.local_addr);
        Server::builder()
            .tcp_nodelay(true)
            .add_service(service)
            .serve_with_incoming_shutdown(
                tokio_stream::wrappers::TcpListenerStream::new(self.listener),
                shutdown,
            )
            .await?;
        info!("Tensor stream server on {} stopped", self.local_addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn unused_port() -> u16 {
        let rx = GrpcRX::bind(0, 1024).await.unwrap();
        rx.local_addr().port()
    }

    #[tokio::test]
    async fn test_open_exchange_does_not_wait_for_the_peer() {
        let port = unused_port().await;
        let mut tx = GrpcTX::new("127.0.0.1", port, 1024);

        // Nothing listens on the port, yet the hand-off succeeds; the refusal
        // only shows up once the response is awaited.
        let pending = tx
            .open_exchange(1, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert!(tx.channel.is_some());

        let err = pending.complete().await.unwrap_err();
        assert_eq!(err.kind(), crate::err::ErrorKind::ConnectionFailure);

        tx.observe_failure(&err);
        assert!(tx.channel.is_none());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_rejected() {
        let mut tx = GrpcTX::new("bad host", 1, 1024);
        assert!(tx.get_or_create_connection().is_err());
        assert!(tx.channel.is_none());
    }
}
