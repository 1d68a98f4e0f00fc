//! The context side of the dispatcher channel.
//!
//! An [`Agent`] announces its execution context with `contextReady`, answers
//! probes, and on `notify` drains its target's queue one instruction at a
//! time through the catalog, reporting results back when the queue is empty
//! or the document navigated away.

use crate::context::ExecutionContext;
use crate::executor::{Executor, run_guarded};
use crate::link::{IncomingRequest, Link};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tabrelay_common::error::TransportError;
use tabrelay_common::instruction::{Instruction, raw_instruction_id};
use tabrelay_common::protocol::{ContextRequest, ContextResponse, TargetId};
use tabrelay_common::result::{ExecutionResult, ExecutionStats};
use tabrelay_common::task::{IdentityPatch, NodeIdentity};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Agent {
    target: TargetId,
    index: u32,
    context: ExecutionContext,
    link: Link,
    /// Serializes drains and explicit batches against the one document.
    run_lock: Arc<Mutex<()>>,
    wake: Arc<Notify>,
}

/// A running agent. Dropping the handle does not stop the agent.
pub struct AgentHandle {
    pub agent: Agent,
    serve: JoinHandle<()>,
}

impl AgentHandle {
    /// Wait until the dispatcher side closes the channel.
    pub async fn closed(self) {
        let _ = self.serve.await;
    }

    pub fn is_finished(&self) -> bool {
        self.serve.is_finished()
    }
}

impl Agent {
    /// Dial the dispatcher at `url` (e.g. `ws://127.0.0.1:9001`) and attach.
    pub async fn connect(
        url: &str,
        target: TargetId,
        index: u32,
        context: ExecutionContext,
        timeout: Duration,
    ) -> Result<AgentHandle, TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Self::attach(ws, target, index, context, timeout).await
    }

    /// Attach over an already-open websocket.
    pub async fn attach<S>(
        ws: WebSocketStream<S>,
        target: TargetId,
        index: u32,
        context: ExecutionContext,
        timeout: Duration,
    ) -> Result<AgentHandle, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (link, incoming) = Link::spawn(ws, timeout);
        let agent = Agent {
            target,
            index,
            context,
            link,
            run_lock: Arc::new(Mutex::new(())),
            wake: Arc::new(Notify::new()),
        };

        agent.announce().await?;
        tokio::spawn(agent.clone().drain_worker());
        let serve = tokio::spawn(agent.clone().serve(incoming));

        Ok(AgentHandle { agent, serve })
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    async fn announce(&self) -> Result<(), TransportError> {
        let url = self.context.document.current_url().await.unwrap_or_default();
        let request = ContextRequest::ContextReady {
            target: self.target.clone(),
            index: self.index,
            url,
        };
        let response = self.link.request(request).await?;
        if !response.ok {
            return Err(TransportError::Rejected(
                response.error.unwrap_or_else(|| "contextReady refused".into()),
            ));
        }
        info!("Context {} (#{}) attached", self.target, self.index);
        Ok(())
    }

    async fn serve(self, mut incoming: mpsc::Receiver<IncomingRequest>) {
        while let Some(IncomingRequest { id, request }) = incoming.recv().await {
            match request {
                ContextRequest::Ping => {
                    let url = self.context.document.current_url().await.unwrap_or_default();
                    let data = json!({ "target": self.target, "index": self.index, "url": url });
                    self.reply(id, ContextResponse::ok(Some(data))).await;
                }
                ContextRequest::Notify => {
                    self.reply(id, ContextResponse::ok(None)).await;
                    self.wake.notify_one();
                }
                ContextRequest::ExecuteInstructions { instructions } => {
                    let agent = self.clone();
                    tokio::spawn(async move {
                        let response = agent.execute_batch(instructions).await;
                        agent.reply(id, response).await;
                    });
                }
                other => {
                    debug!("Refusing {} from dispatcher", other.action());
                    let message = format!("unsupported action '{}'", other.action());
                    self.reply(id, ContextResponse::error(message)).await;
                }
            }
        }

        info!("Context {} detached", self.target);
        // Let the drain worker observe the closed link and exit.
        self.wake.notify_one();
    }

    async fn reply(&self, id: u64, response: ContextResponse) {
        if let Err(e) = self.link.respond(id, response).await {
            warn!("Failed to answer request #{}: {}", id, e);
        }
    }

    /// Run an explicit batch. Malformed entries become failures; the rest
    /// run through an [`Executor`].
    async fn execute_batch(&self, raw: Vec<serde_json::Value>) -> ContextResponse {
        let mut valid = Vec::with_capacity(raw.len());
        let mut rejected = Vec::new();
        for value in raw {
            match serde_json::from_value::<Instruction>(value.clone()) {
                Ok(instruction) => valid.push(instruction),
                Err(e) => rejected.push(ExecutionResult::failure(
                    raw_instruction_id(&value),
                    Duration::ZERO,
                    format!("Invalid instruction: {}", e),
                )),
            }
        }

        let _guard = self.run_lock.lock().await;
        let mut executor = Executor::with_instructions(self.context.clone(), valid);
        executor.execute_all().await;
        let mut results = executor.into_results();
        results.extend(rejected);

        let stats = ExecutionStats::from_results(&results);
        ContextResponse::ok(Some(json!({ "results": results, "stats": stats })))
    }

    async fn drain_worker(self) {
        loop {
            self.wake.notified().await;
            if self.link.is_closed() {
                break;
            }
            if let Err(e) = self.drain().await {
                warn!("Draining {} failed: {}", self.target, e);
            }
        }
        debug!("Drain worker for {} exiting", self.target);
    }

    /// Pull and run instructions until the queue is empty or a navigation
    /// succeeds, then report what ran.
    pub async fn drain(&self) -> Result<Vec<ExecutionResult>, TransportError> {
        let _guard = self.run_lock.lock().await;
        let mut results = Vec::new();
        let mut navigated_to = None;

        loop {
            let response = self.link.request(ContextRequest::GetSingleInstruction).await?;
            if !response.ok {
                warn!(
                    "Dispatcher refused getSingleInstruction: {}",
                    response.error.as_deref().unwrap_or("unknown error")
                );
                break;
            }
            let Some(raw) = response.into_data() else {
                break;
            };

            let instruction = match serde_json::from_value::<Instruction>(raw.clone()) {
                Ok(instruction) => instruction,
                Err(e) => {
                    results.push(ExecutionResult::failure(
                        raw_instruction_id(&raw),
                        Duration::ZERO,
                        format!("Invalid instruction: {}", e),
                    ));
                    continue;
                }
            };

            let result = run_guarded(&instruction, &self.context).await;
            let navigated = result.success && instruction.kind.is_navigate();
            results.push(result);
            if navigated {
                navigated_to = Some(self.context.document.current_url().await.unwrap_or_default());
                break;
            }
        }

        if let Some(url) = navigated_to {
            info!("Context {} navigated to {}", self.target, url);
            self.link
                .request(ContextRequest::ContextNavigated { url })
                .await?;
        }

        if !results.is_empty() {
            let stats = ExecutionStats::from_results(&results);
            info!(
                "Context {} ran {} instructions ({} failed)",
                self.target, stats.total, stats.failure
            );
            self.link
                .request(ContextRequest::ReportResults {
                    results: results.clone(),
                    stats,
                })
                .await?;
        }

        Ok(results)
    }

    pub async fn node_profile(&self) -> Result<Option<NodeIdentity>, TransportError> {
        let response = self.link.request(ContextRequest::GetNodeProfile).await?;
        if !response.ok {
            return Err(TransportError::Rejected(response.error.unwrap_or_default()));
        }
        match response.into_data() {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }

    pub async fn update_node_profile(&self, profile: IdentityPatch) -> Result<(), TransportError> {
        let response = self
            .link
            .request(ContextRequest::UpdateNodeProfile { profile })
            .await?;
        if response.ok {
            Ok(())
        } else {
            Err(TransportError::Rejected(response.error.unwrap_or_default()))
        }
    }
}
