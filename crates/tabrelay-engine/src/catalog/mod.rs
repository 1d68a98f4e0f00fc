//! The instruction catalog: one body per [`InstructionKind`], all run
//! through the same validate / delay / retry envelope.

mod extract;
mod keyboard;
mod pointer;
mod wait;

pub use keyboard::effective_key;
pub use pointer::{click_point, drag_steps};

use crate::context::ExecutionContext;
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tabrelay_common::error::InstructionError;
use tabrelay_common::instruction::{Instruction, InstructionKind, LocatePayload, NavigatePayload};
use tabrelay_common::result::ExecutionResult;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Run one instruction to completion.
///
/// Failures never escape: the outcome is always an [`ExecutionResult`]
/// carrying the elapsed time. Validation failures are reported without
/// any side effect and are not retried.
pub async fn execute(instruction: &Instruction, ctx: &ExecutionContext) -> ExecutionResult {
    let started = Instant::now();
    let id = instruction.id.as_str();

    if let Err(e) = instruction.validate() {
        warn!("Rejecting {} '{}': {}", instruction.type_tag(), id, e);
        return ExecutionResult::failure(id, started.elapsed(), e.to_string());
    }

    let delay = instruction.delay();
    if !delay.is_zero() {
        debug!("Delaying '{}' by {:?}", id, delay);
        tokio::time::sleep(delay).await;
    }

    let outcome = execute_with_retry(
        instruction.attempts(),
        ctx.settings.retry_backoff(),
        |attempt| {
            debug!(
                "Running {} '{}' (attempt {})",
                instruction.type_tag(),
                id,
                attempt
            );
            run_body(instruction, ctx)
        },
    )
    .await;

    match outcome {
        Ok(data) => ExecutionResult::success(id, started.elapsed(), data),
        Err(e) => {
            warn!("{} '{}' failed: {}", instruction.type_tag(), id, e);
            ExecutionResult::failure(id, started.elapsed(), e.to_string())
        }
    }
}

/// Call `body` up to `attempts` times (at least once), sleeping `backoff`
/// between failed attempts. The last error is returned if every attempt
/// fails.
pub async fn execute_with_retry<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut body: F,
) -> Result<T, InstructionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, InstructionError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match body(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_body(
    instruction: &Instruction,
    ctx: &ExecutionContext,
) -> Result<Option<Value>, InstructionError> {
    let timeout = instruction.timeout();
    let wait_for_visible = instruction.wait_for_visible;

    match &instruction.kind {
        InstructionKind::Navigate(p) => navigate(p, ctx).await,
        InstructionKind::Locate(p) => locate(p, ctx).await,
        InstructionKind::Click(p) => pointer::click(p, ctx, wait_for_visible, timeout).await,
        InstructionKind::Drag(p) => pointer::drag(p, ctx, timeout).await,
        InstructionKind::InputText(p) => keyboard::input_text(p, ctx).await,
        InstructionKind::KeyPress(p) => keyboard::key_press(p, ctx).await,
        InstructionKind::Wait(p) => wait::wait(p, ctx, timeout).await,
        InstructionKind::GetText(p) => extract::get_text(p, ctx).await,
    }
}

async fn navigate(
    payload: &NavigatePayload,
    ctx: &ExecutionContext,
) -> Result<Option<Value>, InstructionError> {
    info!("Navigating to {}", payload.url);
    ctx.document.navigate(&payload.url).await?;
    ctx.registry.refresh_all();
    Ok(Some(json!({ "url": payload.url })))
}

async fn locate(
    payload: &LocatePayload,
    ctx: &ExecutionContext,
) -> Result<Option<Value>, InstructionError> {
    let mut descriptor = payload.element.clone();
    descriptor.invalidate();

    let handle = ctx
        .locator
        .resolve(&mut descriptor)
        .await
        .ok_or_else(|| InstructionError::ElementNotFound(descriptor.name.clone()))?;

    debug!("Located '{}'", descriptor.name);
    let name = descriptor.name.clone();
    ctx.registry.upsert(descriptor);
    Ok(Some(json!({ "name": name, "node": handle })))
}
