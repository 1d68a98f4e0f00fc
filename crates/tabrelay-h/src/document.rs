use async_trait::async_trait;
use chromiumoxide::Page;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tabrelay_engine::document::{
    ComputedStyle, Document, EventTarget, ListenerId, NodeInfo, OffsetBox, PredicateKind,
    SyntheticEvent, TransferHandle, Viewport,
};
use tabrelay_engine::element::{NodeHandle, Rect};
use tabrelay_engine::error::DocumentError;
use tabrelay_engine::instruction::TextType;
use tracing::debug;

const BRIDGE_JS: &str = include_str!("bridge.js");

/// Bounds one evaluation; a dialog blocking the JS thread would otherwise hang it.
const EVAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Retries while the page is between documents.
const MAX_CONTEXT_RETRIES: u32 = 10;

const CONTEXT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handles from different documents never collide: each bridge install
/// numbers its nodes from a fresh block.
const HANDLE_BLOCK: u64 = 1 << 32;

fn is_context_error(err: &str) -> bool {
    err.contains("Cannot find context")
        || err.contains("Execution context was destroyed")
        || err.contains("-32000")
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

enum EvalError {
    Timeout,
    Context(String),
    Other(String),
}

/// A Chromium page driven over CDP.
pub struct CdpDocument {
    page: Page,
    installs: AtomicU64,
}

impl CdpDocument {
    pub fn new(page: Page) -> Self {
        Self {
            page,
            installs: AtomicU64::new(1),
        }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, EvalError> {
        match tokio::time::timeout(EVAL_TIMEOUT, self.page.evaluate(expression)).await {
            Err(_) => Err(EvalError::Timeout),
            Ok(Err(e)) => {
                let err = e.to_string();
                if is_context_error(&err) {
                    Err(EvalError::Context(err))
                } else {
                    Err(EvalError::Other(err))
                }
            }
            Ok(Ok(result)) => Ok(result.into_value::<Value>().unwrap_or(Value::Null)),
        }
    }

    async fn ensure_bridge(&self) -> Result<(), EvalError> {
        let loaded = self
            .evaluate("typeof window.__tabrelay !== 'undefined'")
            .await?;
        if loaded.as_bool() != Some(true) {
            let block = self.installs.fetch_add(1, Ordering::SeqCst) * HANDLE_BLOCK;
            debug!("Installing page bridge (handles from {})", block);
            self.evaluate(&format!("{}({})", BRIDGE_JS, block)).await?;
        }
        Ok(())
    }

    async fn try_call(&self, expression: &str) -> Result<Value, EvalError> {
        self.ensure_bridge().await?;
        self.evaluate(expression).await
    }

    /// Invoke a bridge method, retrying while the page navigates.
    async fn call<T: DeserializeOwned>(&self, method: &str, args: Value) -> Result<T, DocumentError> {
        let expression = format!(
            "window.__tabrelay.call({}, {})",
            serde_json::to_string(method)?,
            serde_json::to_string(&args)?
        );

        let mut last_error = None;
        for attempt in 0..MAX_CONTEXT_RETRIES {
            match self.try_call(&expression).await {
                Ok(raw) => {
                    let reply: BridgeReply = serde_json::from_value(raw)?;
                    if !reply.ok {
                        return Err(DocumentError::Script(
                            reply.error.unwrap_or_else(|| format!("{} failed", method)),
                        ));
                    }
                    return Ok(serde_json::from_value(reply.value)?);
                }
                Err(EvalError::Timeout) => {
                    return Err(DocumentError::Script(format!(
                        "{} timed out, possibly blocked by a dialog",
                        method
                    )));
                }
                Err(EvalError::Context(err)) => {
                    debug!(
                        "{} context error (attempt {}/{}), retrying...",
                        method,
                        attempt + 1,
                        MAX_CONTEXT_RETRIES
                    );
                    last_error = Some(err);
                    tokio::time::sleep(CONTEXT_RETRY_DELAY).await;
                }
                Err(EvalError::Other(err)) => return Err(DocumentError::Script(err)),
            }
        }

        debug!(
            "{} gave up: {}",
            method,
            last_error.unwrap_or_else(|| "no context".into())
        );
        Err(DocumentError::Detached)
    }
}

#[async_trait]
impl Document for CdpDocument {
    async fn query_css(&self, selector: &str) -> Result<Option<NodeHandle>, DocumentError> {
        self.call("queryCss", json!([selector])).await
    }

    async fn query_xpath(&self, expression: &str) -> Result<Option<NodeHandle>, DocumentError> {
        self.call("queryXpath", json!([expression])).await
    }

    async fn query_id(&self, id: &str) -> Result<Option<NodeHandle>, DocumentError> {
        self.call("queryId", json!([id])).await
    }

    async fn is_attached(&self, node: NodeHandle) -> Result<bool, DocumentError> {
        self.call("isAttached", json!([node])).await
    }

    async fn computed_style(&self, node: NodeHandle) -> Result<ComputedStyle, DocumentError> {
        self.call("computedStyle", json!([node])).await
    }

    async fn bounding_rect(&self, node: NodeHandle) -> Result<Rect, DocumentError> {
        self.call("boundingRect", json!([node])).await
    }

    async fn offset_box(&self, node: NodeHandle) -> Result<Option<OffsetBox>, DocumentError> {
        self.call("offsetBox", json!([node])).await
    }

    async fn viewport(&self) -> Result<Viewport, DocumentError> {
        self.call("viewport", json!([])).await
    }

    async fn node_info(&self, node: NodeHandle) -> Result<NodeInfo, DocumentError> {
        self.call("nodeInfo", json!([node])).await
    }

    async fn scroll_into_view(&self, node: NodeHandle) -> Result<bool, DocumentError> {
        self.call("scrollIntoView", json!([node])).await
    }

    async fn focus(&self, node: NodeHandle) -> Result<(), DocumentError> {
        self.call::<Value>("focus", json!([node])).await.map(drop)
    }

    async fn dispatch(
        &self,
        target: EventTarget,
        event: SyntheticEvent,
    ) -> Result<(), DocumentError> {
        self.call::<Value>("dispatch", json!([target, event]))
            .await
            .map(drop)
    }

    async fn insert_text(&self, node: NodeHandle, text: &str) -> Result<(), DocumentError> {
        self.call::<Value>("insertText", json!([node, text]))
            .await
            .map(drop)
    }

    async fn set_value(&self, node: NodeHandle, value: &str) -> Result<(), DocumentError> {
        self.call::<Value>("setValue", json!([node, value]))
            .await
            .map(drop)
    }

    async fn get_attribute(
        &self,
        node: NodeHandle,
        name: &str,
    ) -> Result<Option<String>, DocumentError> {
        self.call("getAttribute", json!([node, name])).await
    }

    async fn set_attribute(
        &self,
        node: NodeHandle,
        name: &str,
        value: &str,
    ) -> Result<(), DocumentError> {
        self.call::<Value>("setAttribute", json!([node, name, value]))
            .await
            .map(drop)
    }

    async fn remove_attribute(&self, node: NodeHandle, name: &str) -> Result<(), DocumentError> {
        self.call::<Value>("removeAttribute", json!([node, name]))
            .await
            .map(drop)
    }

    async fn new_data_transfer(&self, text: &str) -> Result<TransferHandle, DocumentError> {
        self.call("newDataTransfer", json!([text])).await
    }

    async fn allow_drop(&self, target: EventTarget) -> Result<ListenerId, DocumentError> {
        self.call("allowDrop", json!([target])).await
    }

    async fn remove_listener(&self, id: ListenerId) -> Result<(), DocumentError> {
        self.call::<Value>("removeListener", json!([id]))
            .await
            .map(drop)
    }

    async fn read_text(&self, node: NodeHandle, kind: TextType) -> Result<String, DocumentError> {
        self.call("readText", json!([node, kind])).await
    }

    async fn markup(&self, node: NodeHandle) -> Result<String, DocumentError> {
        self.call("markup", json!([node])).await
    }

    async fn navigate(&self, url: &str) -> Result<(), DocumentError> {
        debug!("Navigating to: {}", url);
        self.page
            .goto(url)
            .await
            .map_err(|e| DocumentError::Script(format!("navigation failed: {}", e)))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DocumentError> {
        self.page
            .url()
            .await
            .map(Option::unwrap_or_default)
            .map_err(|e| DocumentError::Script(e.to_string()))
    }

    async fn evaluate_predicate(
        &self,
        script: &str,
        kind: PredicateKind,
    ) -> Result<bool, DocumentError> {
        self.call("evaluatePredicate", json!([script, kind])).await
    }

    async fn pending_resources(&self) -> Result<usize, DocumentError> {
        self.call("pendingResources", json!([])).await
    }
}
