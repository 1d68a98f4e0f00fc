//! Name-to-node resolution with a revalidated handle cache, plus the
//! visibility and geometry queries the input protocols rely on.

use crate::document::Document;
use std::sync::Arc;
use tabrelay_common::element::{ElementDescriptor, NodeHandle, Rect, SelectorType};
use tracing::{debug, warn};

/// Upper bound on `offsetParent` hops, in case a host reports a cycle.
const MAX_OFFSET_DEPTH: usize = 64;

#[derive(Clone)]
pub struct ElementLocator {
    document: Arc<dyn Document>,
    viewport_margin: f64,
}

impl ElementLocator {
    pub fn new(document: Arc<dyn Document>, viewport_margin: f64) -> Self {
        Self {
            document,
            viewport_margin,
        }
    }

    pub fn document(&self) -> &Arc<dyn Document> {
        &self.document
    }

    /// Resolve a descriptor to a live node.
    ///
    /// A cached handle is reused only while the document still reports it
    /// attached. Not finding the node is an ordinary `None`, and it leaves
    /// the cache cleared.
    pub async fn resolve(&self, descriptor: &mut ElementDescriptor) -> Option<NodeHandle> {
        if let Some(handle) = descriptor.cached_handle() {
            match self.document.is_attached(handle).await {
                Ok(true) => return Some(handle),
                Ok(false) => debug!("Cached handle for '{}' went stale", descriptor.name),
                Err(e) => debug!("Revalidating '{}' failed: {}", descriptor.name, e),
            }
            descriptor.invalidate();
        }

        let selector = descriptor.selector.as_str();
        let lookup = match descriptor.selector_type {
            SelectorType::Css => self.document.query_css(selector).await,
            SelectorType::Xpath => self.document.query_xpath(selector).await,
            SelectorType::Id => self.document.query_id(selector).await,
        };

        match lookup {
            Ok(Some(handle)) => {
                descriptor.cache_handle(handle);
                Some(handle)
            }
            Ok(None) => {
                debug!(
                    "No node for '{}' ({:?} {})",
                    descriptor.name, descriptor.selector_type, selector
                );
                None
            }
            Err(e) => {
                warn!("Resolving '{}' failed: {}", descriptor.name, e);
                None
            }
        }
    }

    /// Forget the cached handle; the next `resolve` queries the document.
    pub fn refresh(&self, descriptor: &mut ElementDescriptor) {
        descriptor.invalidate();
    }

    /// Style is not hidden, the box is non-empty, and the box intersects the
    /// viewport grown by the configured margin.
    pub async fn is_visible(&self, node: NodeHandle) -> bool {
        match self.document.computed_style(node).await {
            Ok(style) if style.is_hidden() => return false,
            Ok(_) => {}
            Err(e) => {
                debug!("Style lookup failed: {}", e);
                return false;
            }
        }

        let Some(rect) = self.bounding_box(node).await else {
            return false;
        };
        if rect.is_empty() {
            return false;
        }

        let viewport = match self.document.viewport().await {
            Ok(v) => v,
            Err(e) => {
                debug!("Viewport lookup failed: {}", e);
                return false;
            }
        };

        let margin = self.viewport_margin;
        rect.bottom() >= -margin
            && rect.right() >= -margin
            && rect.top <= viewport.height + margin
            && rect.left <= viewport.width + margin
    }

    /// Viewport-relative box of the node.
    ///
    /// Form controls sometimes report a zero-sized client rect; for those the
    /// box is rebuilt from offsets accumulated up the `offsetParent` chain.
    pub async fn bounding_box(&self, node: NodeHandle) -> Option<Rect> {
        let rect = match self.document.bounding_rect(node).await {
            Ok(rect) => rect,
            Err(e) => {
                debug!("Bounding rect lookup failed: {}", e);
                return None;
            }
        };
        if !rect.is_empty() {
            return Some(rect);
        }

        let is_form_control = self
            .document
            .node_info(node)
            .await
            .map(|info| info.is_form_control())
            .unwrap_or(false);
        if is_form_control && let Some(fallback) = self.offset_rect(node).await {
            debug!("Using offset geometry for zero-sized form control");
            return Some(fallback);
        }

        Some(rect)
    }

    async fn offset_rect(&self, node: NodeHandle) -> Option<Rect> {
        let first = self.document.offset_box(node).await.ok()??;
        if first.width <= 0.0 || first.height <= 0.0 {
            return None;
        }

        let (mut left, mut top) = (first.left, first.top);
        let mut parent = first.offset_parent;
        let mut depth = 0;
        while let Some(handle) = parent {
            if depth >= MAX_OFFSET_DEPTH {
                break;
            }
            match self.document.offset_box(handle).await {
                Ok(Some(parent_box)) => {
                    left += parent_box.left;
                    top += parent_box.top;
                    parent = parent_box.offset_parent;
                }
                _ => break,
            }
            depth += 1;
        }

        let viewport = self.document.viewport().await.unwrap_or_default();
        Some(Rect::new(
            left - viewport.scroll_x,
            top - viewport.scroll_y,
            first.width,
            first.height,
        ))
    }

    pub async fn scroll_into_view(&self, node: NodeHandle) -> bool {
        match self.document.scroll_into_view(node).await {
            Ok(scrolled) => scrolled,
            Err(e) => {
                debug!("Scroll into view failed: {}", e);
                false
            }
        }
    }
}
