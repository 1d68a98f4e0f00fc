use crate::context::ExecutionContext;
use crate::document::{DragEventName, EventTarget, ListenerId, MouseEventName, SyntheticEvent, TransferHandle};
use serde_json::{Value, json};
use std::time::Duration;
use tabrelay_common::element::{NodeHandle, Point, Rect};
use tabrelay_common::error::InstructionError;
use tabrelay_common::instruction::{ClickPayload, DragPayload, secs};
use tracing::{debug, warn};

/// Bounding-box center shifted by the caller's offset.
pub fn click_point(rect: &Rect, offset_x: f64, offset_y: f64) -> Point {
    let center = rect.center();
    Point::new(center.x + offset_x, center.y + offset_y)
}

/// Interpolation steps for a drag lasting `duration` seconds.
pub fn drag_steps(duration: f64) -> u32 {
    let steps = (duration.max(0.0) * 10.0).round();
    (steps as u32).max(5)
}

fn mouse(name: MouseEventName, at: Point, detail: u32) -> SyntheticEvent {
    SyntheticEvent::Mouse {
        name,
        x: at.x,
        y: at.y,
        button: 0,
        detail,
    }
}

fn drag_event(name: DragEventName, at: Point, transfer: TransferHandle) -> SyntheticEvent {
    SyntheticEvent::Drag {
        name,
        x: at.x,
        y: at.y,
        transfer,
    }
}

pub(super) async fn click(
    payload: &ClickPayload,
    ctx: &ExecutionContext,
    wait_for_visible: bool,
    timeout: Duration,
) -> Result<Option<Value>, InstructionError> {
    let name = payload.element_name.as_str();
    let node = ctx.resolve_named(name).await?;
    if wait_for_visible {
        ctx.ensure_visible(node, name, timeout).await?;
    }

    let rect = ctx.geometry(node, name).await?;
    let at = click_point(&rect, payload.offset_x, payload.offset_y);
    let target = EventTarget::node(node);
    let doc = &ctx.document;

    let cycles = if payload.double { 2 } else { 1 };
    for detail in 1..=cycles {
        doc.dispatch(target, mouse(MouseEventName::MouseDown, at, detail)).await?;
        doc.dispatch(target, mouse(MouseEventName::MouseUp, at, detail)).await?;
        doc.dispatch(target, mouse(MouseEventName::Click, at, detail)).await?;
    }
    if payload.double {
        doc.dispatch(target, mouse(MouseEventName::DblClick, at, 2)).await?;
    }

    debug!("Clicked '{}' at ({}, {})", name, at.x, at.y);
    Ok(Some(json!({ "x": at.x, "y": at.y, "double": payload.double })))
}

/// State to undo once the drag finishes, whatever the outcome.
#[derive(Default)]
struct DragCleanup {
    listeners: Vec<ListenerId>,
    source: Option<(NodeHandle, Option<String>)>,
}

impl DragCleanup {
    async fn run(self, ctx: &ExecutionContext) {
        for id in self.listeners {
            if let Err(e) = ctx.document.remove_listener(id).await {
                warn!("Failed to remove drop listener: {}", e);
            }
        }
        if let Some((node, previous)) = self.source {
            let restored = match previous {
                Some(value) => ctx.document.set_attribute(node, "draggable", &value).await,
                None => ctx.document.remove_attribute(node, "draggable").await,
            };
            if let Err(e) = restored {
                warn!("Failed to restore draggable attribute: {}", e);
            }
        }
    }
}

pub(super) async fn drag(
    payload: &DragPayload,
    ctx: &ExecutionContext,
    timeout: Duration,
) -> Result<Option<Value>, InstructionError> {
    let source = ctx.resolve_named(&payload.source_name).await?;
    let target = ctx.resolve_named(&payload.target_name).await?;

    ctx.ensure_visible(source, &payload.source_name, timeout).await?;
    ctx.ensure_visible(target, &payload.target_name, timeout).await?;
    tokio::time::sleep(ctx.settings.drag_settle()).await;

    let from = ctx.geometry(source, &payload.source_name).await?.center();
    let to = ctx.geometry(target, &payload.target_name).await?.center();

    let mut cleanup = DragCleanup::default();
    let outcome = perform_drag(payload, ctx, source, target, from, to, &mut cleanup).await;
    cleanup.run(ctx).await;
    outcome
}

async fn perform_drag(
    payload: &DragPayload,
    ctx: &ExecutionContext,
    source: NodeHandle,
    target: NodeHandle,
    from: Point,
    to: Point,
    cleanup: &mut DragCleanup,
) -> Result<Option<Value>, InstructionError> {
    let doc = &ctx.document;

    let previous = doc.get_attribute(source, "draggable").await?;
    doc.set_attribute(source, "draggable", "true").await?;
    cleanup.source = Some((source, previous));

    cleanup
        .listeners
        .push(doc.allow_drop(EventTarget::node(target)).await?);
    cleanup.listeners.push(doc.allow_drop(EventTarget::Document).await?);

    let transfer = doc.new_data_transfer(&payload.source_name).await?;
    let on_source = EventTarget::node(source);
    let on_target = EventTarget::node(target);

    doc.dispatch(on_source, mouse(MouseEventName::MouseDown, from, 1)).await?;
    doc.dispatch(on_source, drag_event(DragEventName::DragStart, from, transfer))
        .await?;
    tokio::time::sleep(ctx.settings.drag_settle()).await;

    let steps = drag_steps(payload.duration);
    let step_pause = secs(payload.duration) / steps;
    for i in 1..=steps {
        let at = from.lerp(&to, f64::from(i) / f64::from(steps));
        let here = EventTarget::AtPoint { x: at.x, y: at.y };
        doc.dispatch(here, mouse(MouseEventName::MouseMove, at, 0)).await?;
        doc.dispatch(here, drag_event(DragEventName::DragOver, at, transfer))
            .await?;
        if !step_pause.is_zero() {
            tokio::time::sleep(step_pause).await;
        }
    }

    doc.dispatch(on_target, drag_event(DragEventName::DragEnter, to, transfer))
        .await?;
    doc.dispatch(on_target, drag_event(DragEventName::DragOver, to, transfer))
        .await?;
    doc.dispatch(on_target, mouse(MouseEventName::MouseUp, to, 1)).await?;
    doc.dispatch(on_target, drag_event(DragEventName::Drop, to, transfer))
        .await?;
    doc.dispatch(on_source, drag_event(DragEventName::DragEnd, to, transfer))
        .await?;
    doc.dispatch(on_target, mouse(MouseEventName::Click, to, 1)).await?;

    debug!(
        "Dragged '{}' onto '{}' in {} steps",
        payload.source_name, payload.target_name, steps
    );
    Ok(Some(json!({
        "from": { "x": from.x, "y": from.y },
        "to": { "x": to.x, "y": to.y },
        "steps": steps,
    })))
}
