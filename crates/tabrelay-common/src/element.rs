use serde::{Deserialize, Serialize};

/// Opaque token for a live node, issued by the host document.
///
/// A handle is only meaningful to the document that issued it and may go
/// stale at any time (navigation, DOM removal). Callers revalidate through
/// the document instead of trusting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    #[default]
    Css,
    Xpath,
    Id,
}

/// Named, selector-based definition of a page element.
///
/// `parent_name`, `children_names` and `related_names` are bookkeeping for
/// export only; nothing walks them while executing instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub selector: String,
    #[serde(default)]
    pub selector_type: SelectorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_names: Vec<String>,
    /// Last value read by a `getText` instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(skip)]
    cached: Option<NodeHandle>,
}

impl ElementDescriptor {
    pub fn new(
        name: impl Into<String>,
        selector: impl Into<String>,
        selector_type: SelectorType,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            selector: selector.into(),
            selector_type,
            parent_name: None,
            children_names: Vec::new(),
            related_names: Vec::new(),
            extracted_text: None,
            cached: None,
        }
    }

    pub fn css(name: impl Into<String>, selector: impl Into<String>) -> Self {
        Self::new(name, selector, SelectorType::Css)
    }

    pub fn cached_handle(&self) -> Option<NodeHandle> {
        self.cached
    }

    pub fn cache_handle(&mut self, handle: NodeHandle) {
        self.cached = Some(handle);
    }

    /// Drop the cached handle so the next access re-resolves.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Linear interpolation towards `to`; `t` is clamped to `[0, 1]`.
    pub fn lerp(&self, to: &Point, t: f64) -> Point {
        let t = t.clamp(0.0, 1.0);
        Point {
            x: self.x + (to.x - self.x) * t,
            y: self.y + (to.y - self.y) * t,
        }
    }
}

/// Viewport-relative box, as returned by `getBoundingClientRect`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.left + self.width / 2.0,
            y: self.top + self.height / 2.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}
