use crate::context::ExecutionContext;
use serde_json::{Value, json};
use tabrelay_common::error::InstructionError;
use tabrelay_common::instruction::GetTextPayload;

pub(super) async fn get_text(
    payload: &GetTextPayload,
    ctx: &ExecutionContext,
) -> Result<Option<Value>, InstructionError> {
    let name = payload.element_name.as_str();
    let node = ctx.resolve_named(name).await?;

    let text = if payload.include_html {
        ctx.document.markup(node).await?
    } else {
        ctx.document.read_text(node, payload.text_type).await?
    };

    ctx.registry.store_text(name, text.clone());
    Ok(Some(json!({
        "elementName": name,
        "textType": payload.text_type,
        "text": text,
    })))
}
