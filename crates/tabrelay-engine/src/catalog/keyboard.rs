use crate::context::ExecutionContext;
use crate::document::{EventTarget, InputEventName, KeyEventName, ModifierState, SyntheticEvent};
use serde_json::{Value, json};
use std::time::Duration;
use tabrelay_common::element::NodeHandle;
use tabrelay_common::error::InstructionError;
use tabrelay_common::instruction::{InputTextPayload, KeyPressPayload, Modifier};
use tracing::debug;

/// The character a key press produces: shift uppercases single letters.
pub fn effective_key(key: &str, modifiers: &[Modifier]) -> String {
    let shift = modifiers.contains(&Modifier::Shift);
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if shift && c.is_alphabetic() => c.to_uppercase().collect(),
        _ => key.to_string(),
    }
}

fn modifier_state(modifiers: &[Modifier]) -> ModifierState {
    let mut state = ModifierState::default();
    for modifier in modifiers {
        match modifier {
            Modifier::Shift => state.shift = true,
            Modifier::Ctrl => state.ctrl = true,
            Modifier::Alt => state.alt = true,
            Modifier::Meta => state.meta = true,
        }
    }
    state
}

/// Physical key code for a key value (`KeyA`, `Digit1`, `Space`, ...).
fn key_code(key: &str) -> String {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(' '), None) => "Space".into(),
        (Some(c), None) if c.is_ascii_alphabetic() => format!("Key{}", c.to_ascii_uppercase()),
        (Some(c), None) if c.is_ascii_digit() => format!("Digit{}", c),
        _ => key.to_string(),
    }
}

fn is_printable(key: &str) -> bool {
    let mut chars = key.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if !c.is_control())
}

fn key_event(name: KeyEventName, key: &str, modifiers: ModifierState) -> SyntheticEvent {
    SyntheticEvent::Key {
        name,
        key: key.to_string(),
        code: key_code(key),
        modifiers,
    }
}

fn input_event(name: InputEventName, data: Option<&str>, input_type: &str) -> SyntheticEvent {
    SyntheticEvent::Input {
        name,
        data: data.map(str::to_string),
        input_type: input_type.to_string(),
    }
}

async fn insert_character(
    ctx: &ExecutionContext,
    node: NodeHandle,
    text: &str,
) -> Result<(), InstructionError> {
    let target = EventTarget::node(node);
    ctx.document
        .dispatch(target, input_event(InputEventName::BeforeInput, Some(text), "insertText"))
        .await?;
    ctx.document.insert_text(node, text).await?;
    ctx.document
        .dispatch(target, input_event(InputEventName::Input, Some(text), "insertText"))
        .await?;
    Ok(())
}

pub(super) async fn input_text(
    payload: &InputTextPayload,
    ctx: &ExecutionContext,
) -> Result<Option<Value>, InstructionError> {
    let name = payload.element_name.as_str();
    let node = ctx.resolve_named(name).await?;

    let info = ctx.document.node_info(node).await?;
    if !info.is_text_editable() {
        return Err(InstructionError::NotEditable(format!(
            "'{}' is a <{}>",
            name, info.tag_name
        )));
    }

    let target = EventTarget::node(node);
    if payload.clear_first {
        ctx.document.set_value(node, "").await?;
        ctx.document
            .dispatch(
                target,
                input_event(InputEventName::Input, None, "deleteContentBackward"),
            )
            .await?;
    }
    ctx.document.focus(node).await?;

    let no_modifiers = ModifierState::default();
    let char_delay = Duration::from_millis(payload.char_delay_ms);
    let mut typed = 0usize;
    for (i, c) in payload.text.chars().enumerate() {
        if i > 0 && !char_delay.is_zero() {
            tokio::time::sleep(char_delay).await;
        }
        let key = c.to_string();
        ctx.document
            .dispatch(target, key_event(KeyEventName::KeyDown, &key, no_modifiers))
            .await?;
        insert_character(ctx, node, &key).await?;
        ctx.document
            .dispatch(target, key_event(KeyEventName::KeyUp, &key, no_modifiers))
            .await?;
        typed += 1;
    }

    ctx.document.dispatch(target, SyntheticEvent::Change).await?;
    debug!("Typed {} characters into '{}'", typed, name);
    Ok(Some(json!({ "typed": typed })))
}

pub(super) async fn key_press(
    payload: &KeyPressPayload,
    ctx: &ExecutionContext,
) -> Result<Option<Value>, InstructionError> {
    let name = payload.element_name.as_str();
    let node = ctx.resolve_named(name).await?;
    let editable = ctx
        .document
        .node_info(node)
        .await
        .map(|info| info.is_text_editable())
        .unwrap_or(false);

    let key = effective_key(&payload.key, &payload.modifiers);
    let modifiers = modifier_state(&payload.modifiers);
    let target = EventTarget::node(node);

    ctx.document.focus(node).await?;
    ctx.document
        .dispatch(target, key_event(KeyEventName::KeyDown, &key, modifiers))
        .await?;

    let chorded = modifiers.ctrl || modifiers.alt || modifiers.meta;
    let inserted = editable && !chorded && is_printable(&key);
    if inserted {
        insert_character(ctx, node, &key).await?;
    }

    ctx.document
        .dispatch(target, key_event(KeyEventName::KeyUp, &key, modifiers))
        .await?;

    if editable {
        tokio::time::sleep(ctx.settings.key_change_delay()).await;
        ctx.document.dispatch(target, SyntheticEvent::Change).await?;
    }

    Ok(Some(json!({ "key": key, "inserted": inserted })))
}
