//! Declarative automation steps.
//!
//! An [`Instruction`] carries the control fields every step shares (delay,
//! retry, timeout, visibility wait) plus a closed [`InstructionKind`] payload.
//! On the wire it is a flat JSON object tagged by `type`:
//!
//! ```json
//! { "type": "click", "id": "c1", "retryCount": 2, "elementName": "submit" }
//! ```
//!
//! Instruction ids are supplied by the caller and are not checked for
//! uniqueness. Anything correlating results by id must tolerate duplicates.

use crate::element::ElementDescriptor;
use crate::error::InstructionError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_retry_count() -> u32 {
    1
}

fn default_timeout() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_drag_duration() -> f64 {
    1.0
}

fn default_char_delay() -> u64 {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    #[serde(default)]
    pub id: String,
    /// Pause applied before the first attempt, in seconds.
    #[serde(default, rename = "delay")]
    pub delay_seconds: f64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_true")]
    pub wait_for_visible: bool,
    #[serde(flatten)]
    pub kind: InstructionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InstructionKind {
    Navigate(NavigatePayload),
    Locate(LocatePayload),
    Click(ClickPayload),
    Drag(DragPayload),
    InputText(InputTextPayload),
    KeyPress(KeyPressPayload),
    Wait(WaitPayload),
    GetText(GetTextPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigatePayload {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatePayload {
    pub element: ElementDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickPayload {
    pub element_name: String,
    #[serde(default)]
    pub offset_x: f64,
    #[serde(default)]
    pub offset_y: f64,
    #[serde(default)]
    pub double: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragPayload {
    pub source_name: String,
    pub target_name: String,
    /// Total pointer travel time in seconds.
    #[serde(default = "default_drag_duration")]
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputTextPayload {
    pub element_name: String,
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_true")]
    pub clear_first: bool,
    #[serde(default = "default_char_delay")]
    pub char_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPressPayload {
    pub element_name: String,
    pub key: String,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Shift,
    #[serde(alias = "control")]
    Ctrl,
    Alt,
    #[serde(alias = "cmd", alias = "command")]
    Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    Time,
    Element,
    Visible,
    Condition,
    Function,
    Network,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitPayload {
    pub mode: WaitMode,
    /// Sleep length for `time` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_name: Option<String>,
    /// Predicate expression (`condition`) or function body (`function`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TextType {
    /// Rendered text (`innerText`).
    #[default]
    InnerText,
    /// Raw text content (`textContent`).
    TextContent,
    /// Form control value.
    Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTextPayload {
    pub element_name: String,
    #[serde(default)]
    pub text_type: TextType,
    #[serde(default)]
    pub include_html: bool,
}

impl Instruction {
    pub fn new(id: impl Into<String>, kind: InstructionKind) -> Self {
        Self {
            id: id.into(),
            delay_seconds: 0.0,
            retry_count: default_retry_count(),
            timeout_seconds: default_timeout(),
            wait_for_visible: true,
            kind,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay_seconds = seconds;
        self
    }

    pub fn with_wait_for_visible(mut self, wait: bool) -> Self {
        self.wait_for_visible = wait;
        self
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind.type_tag()
    }

    /// Number of attempts the retry runner makes: `max(1, retry_count)`.
    pub fn attempts(&self) -> u32 {
        self.retry_count.max(1)
    }

    pub fn delay(&self) -> Duration {
        secs(self.delay_seconds)
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_seconds)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Check the shared control fields and the type-specific required fields.
    pub fn validate(&self) -> Result<(), InstructionError> {
        if self.id.trim().is_empty() {
            return Err(invalid("instruction id is empty"));
        }
        check_seconds("delay", self.delay_seconds)?;
        check_seconds("timeout", self.timeout_seconds)?;

        match &self.kind {
            InstructionKind::Navigate(p) => {
                require("url", &p.url)?;
                url::Url::parse(&p.url)
                    .map_err(|e| invalid(format!("url '{}' is not absolute: {}", p.url, e)))?;
            }
            InstructionKind::Locate(p) => {
                require("element.name", &p.element.name)?;
                require("element.selector", &p.element.selector)?;
            }
            InstructionKind::Click(p) => {
                require("elementName", &p.element_name)?;
                if !p.offset_x.is_finite() || !p.offset_y.is_finite() {
                    return Err(invalid("click offsets must be finite"));
                }
            }
            InstructionKind::Drag(p) => {
                require("sourceName", &p.source_name)?;
                require("targetName", &p.target_name)?;
                check_seconds("drag duration", p.duration)?;
            }
            InstructionKind::InputText(p) => require("elementName", &p.element_name)?,
            InstructionKind::KeyPress(p) => {
                require("elementName", &p.element_name)?;
                require("key", &p.key)?;
            }
            InstructionKind::Wait(p) => match p.mode {
                WaitMode::Time => match p.seconds {
                    Some(s) => check_seconds("wait seconds", s)?,
                    None => return Err(invalid("time wait requires 'seconds'")),
                },
                WaitMode::Element | WaitMode::Visible => {
                    require("elementName", p.element_name.as_deref().unwrap_or_default())?
                }
                WaitMode::Condition | WaitMode::Function => {
                    require("script", p.script.as_deref().unwrap_or_default())?
                }
                WaitMode::Network => {}
            },
            InstructionKind::GetText(p) => require("elementName", &p.element_name)?,
        }
        Ok(())
    }
}

impl InstructionKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            InstructionKind::Navigate(_) => "navigate",
            InstructionKind::Locate(_) => "locate",
            InstructionKind::Click(_) => "click",
            InstructionKind::Drag(_) => "drag",
            InstructionKind::InputText(_) => "inputText",
            InstructionKind::KeyPress(_) => "keyPress",
            InstructionKind::Wait(_) => "wait",
            InstructionKind::GetText(_) => "getText",
        }
    }

    pub fn is_navigate(&self) -> bool {
        matches!(self, InstructionKind::Navigate(_))
    }
}

/// Best-effort id lookup on a payload that failed to parse.
pub fn raw_instruction_id(raw: &serde_json::Value) -> String {
    match raw.get("id") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Upper bound for every time field of an instruction, in seconds.
pub const MAX_SECONDS: f64 = 86_400.0;

/// Seconds to a `Duration`, clamped to `0..=MAX_SECONDS`. NaN maps to zero.
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_SECONDS)).unwrap_or(Duration::ZERO)
}

fn check_seconds(field: &str, value: f64) -> Result<(), InstructionError> {
    if value.is_finite() && (0.0..=MAX_SECONDS).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!(
            "{} must be between 0 and {} seconds",
            field, MAX_SECONDS
        )))
    }
}

fn invalid(msg: impl Into<String>) -> InstructionError {
    InstructionError::Validation(msg.into())
}

fn require(field: &str, value: &str) -> Result<(), InstructionError> {
    if value.trim().is_empty() {
        Err(invalid(format!("missing required field '{}'", field)))
    } else {
        Ok(())
    }
}
