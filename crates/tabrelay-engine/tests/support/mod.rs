#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tabrelay_engine::config::EngineSettings;
use tabrelay_engine::context::ExecutionContext;
use tabrelay_engine::document::{
    ComputedStyle, Document, EventTarget, ListenerId, NodeInfo, OffsetBox, PredicateKind,
    SyntheticEvent, TransferHandle, Viewport,
};
use tabrelay_engine::element::{ElementDescriptor, NodeHandle, Rect};
use tabrelay_engine::error::DocumentError;
use tabrelay_engine::instruction::TextType;

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub attached: bool,
    pub style: ComputedStyle,
    pub rect: Rect,
    /// Rect reported once the node was scrolled into view.
    pub scrolled_rect: Option<Rect>,
    pub offset: Option<OffsetBox>,
    pub info: NodeInfo,
    pub attributes: HashMap<String, String>,
    pub value: String,
    pub text: String,
    pub html: String,
}

impl FakeNode {
    pub fn new(tag: &str, rect: Rect) -> Self {
        Self {
            attached: true,
            style: ComputedStyle::default(),
            rect,
            scrolled_rect: None,
            offset: None,
            info: NodeInfo {
                tag_name: tag.into(),
                ..NodeInfo::default()
            },
            attributes: HashMap::new(),
            value: String::new(),
            text: String::new(),
            html: format!("<{tag}></{tag}>"),
        }
    }

    pub fn input(rect: Rect) -> Self {
        let mut node = Self::new("input", rect);
        node.info.input_type = Some("text".into());
        node
    }
}

#[derive(Default)]
pub struct FakeState {
    pub nodes: HashMap<NodeHandle, FakeNode>,
    pub css: HashMap<String, NodeHandle>,
    pub xpath: HashMap<String, NodeHandle>,
    pub ids: HashMap<String, NodeHandle>,
    pub queries: HashMap<String, usize>,
    pub events: Vec<(EventTarget, SyntheticEvent)>,
    pub inserted: Vec<(NodeHandle, String)>,
    pub focused: Vec<NodeHandle>,
    pub scrolled: Vec<NodeHandle>,
    pub listeners: HashSet<ListenerId>,
    pub listeners_installed: usize,
    pub next_listener: u64,
    pub transfers: Vec<String>,
    pub url: String,
    pub navigations: Vec<String>,
    pub fail_navigation: bool,
    pub pending_resources: VecDeque<usize>,
    pub predicate_results: VecDeque<Result<bool, DocumentError>>,
    pub predicate_calls: usize,
    pub fail_dispatch_of: Option<String>,
    pub viewport: Viewport,
}

#[derive(Clone)]
pub struct FakeDocument {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeDocument {
    pub fn new() -> Self {
        let state = FakeState {
            url: "https://example.com/".into(),
            viewport: Viewport {
                width: 1280.0,
                height: 800.0,
                scroll_x: 0.0,
                scroll_y: 0.0,
            },
            ..FakeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Add a node reachable through the CSS selector `selector`.
    pub fn add(&self, handle: u64, selector: &str, node: FakeNode) -> NodeHandle {
        let handle = NodeHandle(handle);
        let mut state = self.state.lock().unwrap();
        state.nodes.insert(handle, node);
        state.css.insert(selector.into(), handle);
        handle
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn node(&self, handle: NodeHandle) -> FakeNode {
        self.state.lock().unwrap().nodes[&handle].clone()
    }

    pub fn queries(&self, selector: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queries
            .get(selector)
            .copied()
            .unwrap_or(0)
    }

    /// DOM names of every dispatched event, in order.
    pub fn event_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .map(|(_, e)| e.dom_name())
            .collect()
    }

    pub fn events(&self) -> Vec<(EventTarget, SyntheticEvent)> {
        self.state.lock().unwrap().events.clone()
    }

    fn lookup(&self, handle: NodeHandle) -> Result<FakeNode, DocumentError> {
        let state = self.state.lock().unwrap();
        match state.nodes.get(&handle) {
            Some(node) if node.attached => Ok(node.clone()),
            _ => Err(DocumentError::Detached),
        }
    }

    fn update(&self, handle: NodeHandle, f: impl FnOnce(&mut FakeNode)) -> Result<(), DocumentError> {
        let mut state = self.state.lock().unwrap();
        match state.nodes.get_mut(&handle) {
            Some(node) if node.attached => {
                f(node);
                Ok(())
            }
            _ => Err(DocumentError::Detached),
        }
    }

    fn query(map: &HashMap<String, NodeHandle>, state: &FakeState, key: &str) -> Option<NodeHandle> {
        let handle = *map.get(key)?;
        state
            .nodes
            .get(&handle)
            .filter(|node| node.attached)
            .map(|_| handle)
    }
}

pub fn context(document: &FakeDocument) -> ExecutionContext {
    ExecutionContext::new(Arc::new(document.clone()), EngineSettings::default())
}

pub fn register(ctx: &ExecutionContext, name: &str, selector: &str) {
    ctx.registry.upsert(ElementDescriptor::css(name, selector));
}

#[async_trait]
impl Document for FakeDocument {
    async fn query_css(&self, selector: &str) -> Result<Option<NodeHandle>, DocumentError> {
        if selector == "panic!" {
            panic!("selector engine exploded");
        }
        let mut state = self.state.lock().unwrap();
        *state.queries.entry(selector.to_string()).or_default() += 1;
        Ok(Self::query(&state.css, &state, selector))
    }

    async fn query_xpath(&self, expression: &str) -> Result<Option<NodeHandle>, DocumentError> {
        let mut state = self.state.lock().unwrap();
        *state.queries.entry(expression.to_string()).or_default() += 1;
        Ok(Self::query(&state.xpath, &state, expression))
    }

    async fn query_id(&self, id: &str) -> Result<Option<NodeHandle>, DocumentError> {
        let mut state = self.state.lock().unwrap();
        *state.queries.entry(id.to_string()).or_default() += 1;
        Ok(Self::query(&state.ids, &state, id))
    }

    async fn is_attached(&self, node: NodeHandle) -> Result<bool, DocumentError> {
        let state = self.state.lock().unwrap();
        Ok(state.nodes.get(&node).is_some_and(|n| n.attached))
    }

    async fn computed_style(&self, node: NodeHandle) -> Result<ComputedStyle, DocumentError> {
        Ok(self.lookup(node)?.style)
    }

    async fn bounding_rect(&self, node: NodeHandle) -> Result<Rect, DocumentError> {
        let state = self.state.lock().unwrap();
        let fake = state.nodes.get(&node).ok_or(DocumentError::Detached)?;
        let rect = match fake.scrolled_rect {
            Some(rect) if state.scrolled.contains(&node) => rect,
            _ => fake.rect,
        };
        Ok(rect)
    }

    async fn offset_box(&self, node: NodeHandle) -> Result<Option<OffsetBox>, DocumentError> {
        Ok(self.lookup(node)?.offset)
    }

    async fn viewport(&self) -> Result<Viewport, DocumentError> {
        Ok(self.state.lock().unwrap().viewport)
    }

    async fn node_info(&self, node: NodeHandle) -> Result<NodeInfo, DocumentError> {
        Ok(self.lookup(node)?.info)
    }

    async fn scroll_into_view(&self, node: NodeHandle) -> Result<bool, DocumentError> {
        self.lookup(node)?;
        self.state.lock().unwrap().scrolled.push(node);
        Ok(true)
    }

    async fn focus(&self, node: NodeHandle) -> Result<(), DocumentError> {
        self.lookup(node)?;
        self.state.lock().unwrap().focused.push(node);
        Ok(())
    }

    async fn dispatch(
        &self,
        target: EventTarget,
        event: SyntheticEvent,
    ) -> Result<(), DocumentError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_dispatch_of.as_deref() == Some(event.dom_name().as_str()) {
            return Err(DocumentError::Script(format!("{} handler threw", event.dom_name())));
        }
        state.events.push((target, event));
        Ok(())
    }

    async fn insert_text(&self, node: NodeHandle, text: &str) -> Result<(), DocumentError> {
        self.update(node, |n| n.value.push_str(text))?;
        self.state
            .lock()
            .unwrap()
            .inserted
            .push((node, text.to_string()));
        Ok(())
    }

    async fn set_value(&self, node: NodeHandle, value: &str) -> Result<(), DocumentError> {
        self.update(node, |n| n.value = value.to_string())
    }

    async fn get_attribute(
        &self,
        node: NodeHandle,
        name: &str,
    ) -> Result<Option<String>, DocumentError> {
        Ok(self.lookup(node)?.attributes.get(name).cloned())
    }

    async fn set_attribute(
        &self,
        node: NodeHandle,
        name: &str,
        value: &str,
    ) -> Result<(), DocumentError> {
        self.update(node, |n| {
            n.attributes.insert(name.to_string(), value.to_string());
        })
    }

    async fn remove_attribute(&self, node: NodeHandle, name: &str) -> Result<(), DocumentError> {
        self.update(node, |n| {
            n.attributes.remove(name);
        })
    }

    async fn new_data_transfer(&self, text: &str) -> Result<TransferHandle, DocumentError> {
        let mut state = self.state.lock().unwrap();
        state.transfers.push(text.to_string());
        Ok(TransferHandle(state.transfers.len() as u64))
    }

    async fn allow_drop(&self, _target: EventTarget) -> Result<ListenerId, DocumentError> {
        let mut state = self.state.lock().unwrap();
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state.listeners.insert(id);
        state.listeners_installed += 1;
        Ok(id)
    }

    async fn remove_listener(&self, id: ListenerId) -> Result<(), DocumentError> {
        self.state.lock().unwrap().listeners.remove(&id);
        Ok(())
    }

    async fn read_text(&self, node: NodeHandle, kind: TextType) -> Result<String, DocumentError> {
        let node = self.lookup(node)?;
        Ok(match kind {
            TextType::Value => node.value,
            TextType::InnerText | TextType::TextContent => node.text,
        })
    }

    async fn markup(&self, node: NodeHandle) -> Result<String, DocumentError> {
        Ok(self.lookup(node)?.html)
    }

    async fn navigate(&self, url: &str) -> Result<(), DocumentError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_navigation {
            return Err(DocumentError::Script("net::ERR_NAME_NOT_RESOLVED".into()));
        }
        state.navigations.push(url.to_string());
        state.url = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DocumentError> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    async fn evaluate_predicate(
        &self,
        _script: &str,
        _kind: PredicateKind,
    ) -> Result<bool, DocumentError> {
        let mut state = self.state.lock().unwrap();
        state.predicate_calls += 1;
        state.predicate_results.pop_front().unwrap_or(Ok(false))
    }

    async fn pending_resources(&self) -> Result<usize, DocumentError> {
        let mut state = self.state.lock().unwrap();
        if state.pending_resources.len() > 1 {
            Ok(state.pending_resources.pop_front().unwrap_or(0))
        } else {
            Ok(state.pending_resources.front().copied().unwrap_or(0))
        }
    }
}
