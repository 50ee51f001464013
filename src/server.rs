//! Client-facing WebSocket server.
//!
//! Each connection gets a reader task, a writer task and a turn loop. Turns on
//! one connection run one at a time in arrival order; connections run
//! concurrently. Disconnecting cancels the in-flight turn, which drops its
//! synthesis channel and kills its transcoding filter.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::protocol::ServerEvent;
use crate::relay::Relay;
use crate::wg::WaitGroup;

/// Path clients connect to.
pub const WS_PATH: &str = "/ws";

const EVENT_QUEUE: usize = 64;
const REQUEST_QUEUE: usize = 16;

/// Accepts client connections and drives them through a [`Relay`].
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
    connections: WaitGroup,
}

impl RelayServer {
    /// Binds the listening socket.
    pub async fn bind(addr: impl ToSocketAddrs, relay: Arc<Relay>) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Relay listening");
        Ok(Self {
            listener,
            relay,
            connections: WaitGroup::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until the process exits.
    pub async fn run(self) -> Result<(), Error> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves, then cancels every connection and
    /// waits for them to finish.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        let shutdown_token = CancellationToken::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let relay = Arc::clone(&self.relay);
                    let token = shutdown_token.child_token();
                    let guard = self.connections.add();
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(e) = handle_connection(stream, peer, relay, token).await {
                            debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!(active = self.connections.count(), "Shutting down");
                    break;
                }
            }
        }

        shutdown_token.cancel();
        self.connections.wait().await;
        info!("Relay stopped");
        Ok(())
    }
}

fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == WS_PATH {
        return Ok(response);
    }
    let mut rejection = ErrorResponse::new(Some(format!("no endpoint at {}", request.uri().path())));
    *rejection.status_mut() = StatusCode::NOT_FOUND;
    Err(rejection)
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    relay: Arc<Relay>,
    token: CancellationToken,
) -> Result<(), Error> {
    let ws = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    info!(peer = %peer, "Client connected");

    let (mut sink, mut stream) = ws.split();
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(EVENT_QUEUE);
    let (request_tx, mut request_rx) = mpsc::channel::<String>(REQUEST_QUEUE);

    let writer_token = token.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Event serialization failed");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(json)).await {
                debug!(error = %e, "Client write failed");
                writer_token.cancel();
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_token = token.clone();
    let reader = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = reader_token.cancelled() => break,
            };
            match msg {
                Some(Ok(Message::Text(text))) => {
                    // A full queue must not hide a disconnect.
                    tokio::select! {
                        sent = request_tx.send(text) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = reader_token.cancelled() => break,
                    }
                }
                Some(Ok(Message::Binary(_))) => warn!("Ignoring binary frame from client"),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Client read failed");
                    break;
                }
            }
        }
        reader_token.cancel();
    });

    loop {
        let text = tokio::select! {
            text = request_rx.recv() => match text {
                Some(text) => text,
                None => break,
            },
            _ = token.cancelled() => break,
        };

        let turn = relay.handle_text(&text, &event_tx);
        tokio::select! {
            result = turn => {
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "Client gone mid-turn");
                    break;
                }
            }
            _ = token.cancelled() => {
                info!(peer = %peer, "Turn cancelled by disconnect");
                break;
            }
        }
    }

    token.cancel();
    drop(event_tx);
    let _ = reader.await;
    let _ = writer.await;
    info!(peer = %peer, "Client disconnected");
    Ok(())
}
