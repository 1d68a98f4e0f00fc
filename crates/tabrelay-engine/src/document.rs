use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabrelay_common::element::{NodeHandle, Rect};
use tabrelay_common::error::DocumentError;
use tabrelay_common::instruction::TextType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedStyle {
    pub display: String,
    pub visibility: String,
    pub opacity: f64,
}

impl Default for ComputedStyle {
    fn default() -> Self {
        Self {
            display: "block".into(),
            visibility: "visible".into(),
            opacity: 1.0,
        }
    }
}

impl ComputedStyle {
    pub fn is_hidden(&self) -> bool {
        self.display == "none"
            || self.visibility == "hidden"
            || self.visibility == "collapse"
            || self.opacity <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub scroll_x: f64,
    #[serde(default)]
    pub scroll_y: f64,
}

/// Box-model offsets relative to `offset_parent` (`offsetLeft` and friends).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub offset_parent: Option<NodeHandle>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Lower-case tag name.
    pub tag_name: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub content_editable: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub read_only: bool,
}

const FORM_CONTROL_TAGS: &[&str] = &["input", "select", "textarea", "button", "option", "label"];

const TEXT_INPUT_TYPES: &[&str] = &[
    "text", "search", "email", "url", "tel", "password", "number", "date", "datetime-local",
    "month", "week", "time",
];

impl NodeInfo {
    pub fn is_form_control(&self) -> bool {
        FORM_CONTROL_TAGS.contains(&self.tag_name.as_str())
    }

    /// Whether text can be typed into the node.
    pub fn is_text_editable(&self) -> bool {
        if self.disabled || self.read_only {
            return false;
        }
        match self.tag_name.as_str() {
            "textarea" => true,
            "input" => {
                let kind = self.input_type.as_deref().unwrap_or("text").to_ascii_lowercase();
                TEXT_INPUT_TYPES.contains(&kind.as_str())
            }
            _ => self.content_editable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(pub u64);

/// Where a synthetic event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "camelCase")]
pub enum EventTarget {
    Node { node: NodeHandle },
    Document,
    /// Whatever element is topmost at the point (falls back to the document).
    AtPoint { x: f64, y: f64 },
}

impl EventTarget {
    pub fn node(node: NodeHandle) -> Self {
        EventTarget::Node { node }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseEventName {
    MouseDown,
    MouseUp,
    Click,
    DblClick,
    MouseMove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DragEventName {
    DragStart,
    DragEnter,
    DragOver,
    Drop,
    DragEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEventName {
    KeyDown,
    KeyUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputEventName {
    BeforeInput,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModifierState {
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub meta: bool,
}

/// A user-input event the engine asks the host to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SyntheticEvent {
    Mouse {
        name: MouseEventName,
        x: f64,
        y: f64,
        button: u8,
        detail: u32,
    },
    Drag {
        name: DragEventName,
        x: f64,
        y: f64,
        transfer: TransferHandle,
    },
    Key {
        name: KeyEventName,
        key: String,
        code: String,
        modifiers: ModifierState,
    },
    Input {
        name: InputEventName,
        data: Option<String>,
        #[serde(rename = "inputType")]
        input_type: String,
    },
    Change,
}

impl SyntheticEvent {
    /// DOM event type string, e.g. `mousedown`.
    pub fn dom_name(&self) -> String {
        let value = match self {
            SyntheticEvent::Mouse { name, .. } => serde_json::to_value(name),
            SyntheticEvent::Drag { name, .. } => serde_json::to_value(name),
            SyntheticEvent::Key { name, .. } => serde_json::to_value(name),
            SyntheticEvent::Input { name, .. } => serde_json::to_value(name),
            SyntheticEvent::Change => return "change".into(),
        };
        value
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredicateKind {
    /// An expression whose truthiness is the answer.
    Expression,
    /// A function body whose return value is the answer.
    Function,
}

/// The host document an execution context is attached to.
///
/// Every user-input protocol is composed from these primitives by the
/// engine, so hosts only need to expose raw DOM access.
#[async_trait]
pub trait Document: Send + Sync {
    async fn query_css(&self, selector: &str) -> Result<Option<NodeHandle>, DocumentError>;

    /// First node in document order matching the expression.
    async fn query_xpath(&self, expression: &str) -> Result<Option<NodeHandle>, DocumentError>;

    async fn query_id(&self, id: &str) -> Result<Option<NodeHandle>, DocumentError>;

    /// False for handles the document no longer knows or that left the tree.
    async fn is_attached(&self, node: NodeHandle) -> Result<bool, DocumentError>;

    async fn computed_style(&self, node: NodeHandle) -> Result<ComputedStyle, DocumentError>;

    async fn bounding_rect(&self, node: NodeHandle) -> Result<Rect, DocumentError>;

    async fn offset_box(&self, node: NodeHandle) -> Result<Option<OffsetBox>, DocumentError>;

    async fn viewport(&self) -> Result<Viewport, DocumentError>;

    async fn node_info(&self, node: NodeHandle) -> Result<NodeInfo, DocumentError>;

    async fn scroll_into_view(&self, node: NodeHandle) -> Result<bool, DocumentError>;

    async fn focus(&self, node: NodeHandle) -> Result<(), DocumentError>;

    async fn dispatch(
        &self,
        target: EventTarget,
        event: SyntheticEvent,
    ) -> Result<(), DocumentError>;

    /// Insert text at the caret of an editable node.
    async fn insert_text(&self, node: NodeHandle, text: &str) -> Result<(), DocumentError>;

    async fn set_value(&self, node: NodeHandle, value: &str) -> Result<(), DocumentError>;

    async fn get_attribute(
        &self,
        node: NodeHandle,
        name: &str,
    ) -> Result<Option<String>, DocumentError>;

    async fn set_attribute(
        &self,
        node: NodeHandle,
        name: &str,
        value: &str,
    ) -> Result<(), DocumentError>;

    async fn remove_attribute(&self, node: NodeHandle, name: &str) -> Result<(), DocumentError>;

    /// Create a drag data store seeded with `text/plain`.
    async fn new_data_transfer(&self, text: &str) -> Result<TransferHandle, DocumentError>;

    /// Install listeners that cancel `dragenter`/`dragover` on the target.
    async fn allow_drop(&self, target: EventTarget) -> Result<ListenerId, DocumentError>;

    async fn remove_listener(&self, id: ListenerId) -> Result<(), DocumentError>;

    async fn read_text(&self, node: NodeHandle, kind: TextType) -> Result<String, DocumentError>;

    /// Full markup of the node (`outerHTML`).
    async fn markup(&self, node: NodeHandle) -> Result<String, DocumentError>;

    async fn navigate(&self, url: &str) -> Result<(), DocumentError>;

    async fn current_url(&self) -> Result<String, DocumentError>;

    async fn evaluate_predicate(
        &self,
        script: &str,
        kind: PredicateKind,
    ) -> Result<bool, DocumentError>;

    /// Resource loads observed as still in flight.
    async fn pending_resources(&self) -> Result<usize, DocumentError>;
}
