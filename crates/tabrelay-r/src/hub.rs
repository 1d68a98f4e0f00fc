//! Websocket endpoint execution contexts attach to.
//!
//! A connection becomes a context once its first request is `contextReady`;
//! from then on the hub routes dispatcher requests to it by target and hands
//! everything the context sends to a [`RequestHandler`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tabrelay_common::error::TransportError;
use tabrelay_common::protocol::{ContextRequest, ContextResponse, TargetId};
use tabrelay_engine::link::{IncomingRequest, Link};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// Dispatcher -> context direction of the channel.
#[async_trait]
pub trait ContextChannel: Send + Sync {
    async fn request(
        &self,
        target: &TargetId,
        request: ContextRequest,
    ) -> Result<ContextResponse, TransportError>;

    /// Whether a live link to `target` exists right now.
    fn has_context(&self, target: &TargetId) -> bool;
}

/// Context -> dispatcher direction of the channel.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, from: &TargetId, request: ContextRequest) -> ContextResponse;

    async fn disconnected(&self, target: &TargetId);
}

struct Connection {
    serial: u64,
    link: Link,
}

#[derive(Clone)]
pub struct ContextHub {
    links: Arc<Mutex<HashMap<TargetId, Connection>>>,
    serial: Arc<AtomicU64>,
    timeout: Duration,
}

impl ContextHub {
    /// `timeout` bounds every request/response exchange on every link.
    pub fn new(timeout: Duration) -> Self {
        Self {
            links: Arc::new(Mutex::new(HashMap::new())),
            serial: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TargetId, Connection>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `127.0.0.1:port` and start accepting contexts.
    pub async fn start(
        &self,
        port: u16,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let local = listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        info!("Context hub listening on: {}", local);

        let hub = self.clone();
        let accept = tokio::spawn(async move {
            info!("Hub accept loop started");
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Accepted TCP connection from: {}", peer);
                        tokio::spawn(hub.clone().accept_connection(stream, handler.clone()));
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((local, accept))
    }

    pub fn connected(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self.lock().keys().cloned().collect();
        targets.sort();
        targets
    }

    async fn accept_connection(self, stream: TcpStream, handler: Arc<dyn RequestHandler>) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("Error during the websocket handshake occurred: {}", e);
                return;
            }
        };

        let (link, mut incoming) = Link::spawn(ws, self.timeout);
        let Some((target, ready)) = self.handshake(&link, &mut incoming).await else {
            return;
        };

        // Register the link before the handler records the context, so the
        // dispatcher never sees a record without a route.
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        let replaced = self.lock().insert(
            target.clone(),
            Connection {
                serial,
                link: link.clone(),
            },
        );

        let response = handler.handle(&target, ready.request).await;
        let accepted = response.ok;
        if let Err(e) = link.respond(ready.id, response).await {
            warn!("Failed to acknowledge {}: {}", target, e);
        }
        if !accepted {
            warn!("Context {} refused", target);
            self.forget(&target, serial);
            return;
        }

        if let Some(previous) = replaced {
            info!("Context {} reconnected", target);
            previous.link.close();
        } else {
            info!("Context {} connected", target);
        }

        while let Some(IncomingRequest { id, request }) = incoming.recv().await {
            let link = link.clone();
            let handler = handler.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let response = handler.handle(&target, request).await;
                if let Err(e) = link.respond(id, response).await {
                    warn!("Failed to answer {} request #{}: {}", target, id, e);
                }
            });
        }

        if self.forget(&target, serial) {
            info!("Context {} disconnected", target);
            handler.disconnected(&target).await;
        }
    }

    /// Drop the route for `target` unless a newer connection replaced it.
    fn forget(&self, target: &TargetId, serial: u64) -> bool {
        let mut links = self.lock();
        match links.get(target) {
            Some(conn) if conn.serial == serial => {
                links.remove(target);
                true
            }
            _ => false,
        }
    }

    /// Wait for `contextReady`; anything else first closes the connection.
    async fn handshake(
        &self,
        link: &Link,
        incoming: &mut mpsc::Receiver<IncomingRequest>,
    ) -> Option<(TargetId, IncomingRequest)> {
        let first = match tokio::time::timeout(self.timeout, incoming.recv()).await {
            Ok(Some(first)) => first,
            Ok(None) => return None,
            Err(_) => {
                warn!("Connection never announced itself");
                return None;
            }
        };

        let target = match &first.request {
            ContextRequest::ContextReady { target, .. } => target.clone(),
            other => {
                warn!("Expected contextReady, got {}", other.action());
                let _ = link
                    .respond(first.id, ContextResponse::error("expected contextReady"))
                    .await;
                return None;
            }
        };
        Some((target, first))
    }
}

#[async_trait]
impl ContextChannel for ContextHub {
    async fn request(
        &self,
        target: &TargetId,
        request: ContextRequest,
    ) -> Result<ContextResponse, TransportError> {
        let link = self
            .lock()
            .get(target)
            .map(|conn| conn.link.clone())
            .ok_or_else(|| TransportError::NoReceiver(target.to_string()))?;
        link.request(request).await
    }

    fn has_context(&self, target: &TargetId) -> bool {
        self.lock()
            .get(target)
            .is_some_and(|conn| !conn.link.is_closed())
    }
}
