//! Accept loop shared by the three services
//!
//! Each service implements [`Handler`]; [`HttpServer`] owns the listener,
//! serves HTTP/1.1 and HTTP/2 on every connection and stops accepting when
//! the shutdown channel flips to `true`.

use crate::body::Body;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// A request handler for one service
///
/// Handlers are infallible: every failure must already be turned into an
/// error response.
pub trait Handler: Send + Sync + 'static {
    /// Name used in log lines
    fn name(&self) -> &'static str;

    fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> impl Future<Output = Response<Body>> + Send;
}

pub struct HttpServer<H> {
    bind_addr: SocketAddr,
    handler: Arc<H>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<H: Handler> HttpServer<H> {
    pub fn new(bind_addr: SocketAddr, handler: Arc<H>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            handler,
            shutdown_rx,
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves)
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let name = self.handler.name();
        info!(service = name, addr = %local_addr, "Server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, handler).await {
                                    debug!(service = name, addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(service = name, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(service = name, "Server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S, H>(stream: S, addr: SocketAddr, handler: Arc<H>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
