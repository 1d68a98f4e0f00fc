use crate::config::EngineSettings;
use crate::document::Document;
use crate::locator::ElementLocator;
use crate::registry::ElementRegistry;
use std::sync::Arc;
use std::time::Duration;
use tabrelay_common::element::{NodeHandle, Rect};
use tabrelay_common::error::InstructionError;
use tokio::time::Instant;
use tracing::debug;

/// `now + timeout`, saturating far in the future instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365))
}

/// Everything an instruction body needs: the host document, the shared
/// element registry and the engine timing knobs.
#[derive(Clone)]
pub struct ExecutionContext {
    pub document: Arc<dyn Document>,
    pub locator: ElementLocator,
    pub registry: ElementRegistry,
    pub settings: EngineSettings,
}

impl ExecutionContext {
    pub fn new(document: Arc<dyn Document>, settings: EngineSettings) -> Self {
        Self::with_registry(document, ElementRegistry::new(), settings)
    }

    pub fn with_registry(
        document: Arc<dyn Document>,
        registry: ElementRegistry,
        settings: EngineSettings,
    ) -> Self {
        let locator = ElementLocator::new(document.clone(), settings.viewport_margin_px);
        Self {
            document,
            locator,
            registry,
            settings,
        }
    }

    /// Resolve a registered element by name, writing the cache back.
    pub async fn try_resolve(&self, name: &str) -> Option<NodeHandle> {
        let mut descriptor = self.registry.get(name)?;
        let handle = self.locator.resolve(&mut descriptor).await;
        self.registry.set_cached_handle(name, handle);
        handle
    }

    pub async fn resolve_named(&self, name: &str) -> Result<NodeHandle, InstructionError> {
        if !self.registry.contains(name) {
            return Err(InstructionError::ElementNotFound(format!(
                "'{}' is not registered",
                name
            )));
        }
        self.try_resolve(name)
            .await
            .ok_or_else(|| InstructionError::ElementNotFound(name.to_string()))
    }

    /// Scroll the node into view and poll until it is visible.
    ///
    /// One last check is made once the deadline passes.
    pub async fn ensure_visible(
        &self,
        node: NodeHandle,
        name: &str,
        timeout: Duration,
    ) -> Result<(), InstructionError> {
        if self.locator.is_visible(node).await {
            return Ok(());
        }

        debug!("'{}' not visible, scrolling into view", name);
        self.locator.scroll_into_view(node).await;

        let deadline = deadline_after(timeout);
        while Instant::now() < deadline {
            if self.locator.is_visible(node).await {
                return Ok(());
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }

        if self.locator.is_visible(node).await {
            Ok(())
        } else {
            Err(InstructionError::Timeout(format!(
                "'{}' did not become visible within {:?}",
                name, timeout
            )))
        }
    }

    pub async fn geometry(&self, node: NodeHandle, name: &str) -> Result<Rect, InstructionError> {
        self.locator
            .bounding_box(node)
            .await
            .ok_or_else(|| InstructionError::ElementNotFound(format!("'{}' has no geometry", name)))
    }
}
