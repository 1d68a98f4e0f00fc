//! Request/response messaging over one websocket.
//!
//! Both ends of the dispatcher <-> context channel use [`Link`]: requests
//! carry a fresh envelope id, responses name the request they answer in
//! `replyTo`, and every outstanding request has a response timeout.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tabrelay_common::error::TransportError;
use tabrelay_common::protocol::{Body, ContextRequest, ContextResponse, Envelope};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ContextResponse>>>>;

/// A request received from the peer, to be answered with [`Link::respond`].
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub id: u64,
    pub request: ContextRequest,
}

#[derive(Clone)]
pub struct Link {
    outbound: mpsc::Sender<Envelope>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    timeout: Duration,
}

impl Link {
    /// Take over a websocket. Requests from the peer arrive on the returned
    /// receiver, which ends once the socket closes.
    pub fn spawn<S>(
        ws: WebSocketStream<S>,
        timeout: Duration,
    ) -> (Link, mpsc::Receiver<IncomingRequest>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (incoming_tx, incoming_rx) = mpsc::channel(64);

        let link = Link {
            outbound: outbound_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            timeout,
        };

        tokio::spawn(pump(
            ws,
            outbound_rx,
            incoming_tx,
            link.pending.clone(),
            link.closed.clone(),
            link.shutdown.clone(),
        ));

        (link, incoming_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a close frame and stop the pump, even while clones are alive.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, request: ContextRequest) -> Result<ContextResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        debug!("-> #{} {}", id, request.action());
        if self.outbound.send(Envelope::request(id, request)).await.is_err() {
            self.forget(id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.forget(id);
                Err(TransportError::Timeout(
                    u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    /// Answer the peer's request `reply_to`.
    pub async fn respond(
        &self,
        reply_to: u64,
        response: ContextResponse,
    ) -> Result<(), TransportError> {
        let envelope = Envelope::response(self.next_id(), reply_to, response);
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    incoming_tx: mpsc::Sender<IncomingRequest>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("Closing link");
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }

            outgoing = outbound_rx.recv() => {
                let Some(envelope) = outgoing else {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to encode envelope #{}: {}", envelope.id, e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Message::Text(json)).await {
                    error!("Failed to send message to WS: {}", e);
                    break;
                }
            }

            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("Dropping malformed frame: {} | Text: {}", e, text);
                                continue;
                            }
                        };
                        match envelope.body {
                            Body::Request(request) => {
                                debug!("<- #{} {}", envelope.id, request.action());
                                let incoming = IncomingRequest { id: envelope.id, request };
                                if incoming_tx.send(incoming).await.is_err() {
                                    debug!("Request receiver dropped");
                                }
                            }
                            Body::Response(response) => {
                                let waiter = envelope.reply_to.and_then(|reply_to| {
                                    pending
                                        .lock()
                                        .unwrap_or_else(PoisonError::into_inner)
                                        .remove(&reply_to)
                                });
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(response);
                                    }
                                    None => debug!(
                                        "Response #{} matches no pending request",
                                        envelope.id
                                    ),
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every outstanding request with `Closed`.
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}
