use crate::context::{ExecutionContext, deadline_after};
use crate::document::PredicateKind;
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tabrelay_common::error::InstructionError;
use tabrelay_common::instruction::{WaitMode, WaitPayload, secs};
use tokio::time::Instant;
use tracing::debug;

/// Poll `check` until it holds or `timeout` passes, with one final check
/// after the deadline.
async fn poll_until<F, Fut>(ctx: &ExecutionContext, timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = deadline_after(timeout);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(ctx.settings.poll_interval()).await;
    }
    check().await
}

pub(super) async fn wait(
    payload: &WaitPayload,
    ctx: &ExecutionContext,
    timeout: Duration,
) -> Result<Option<Value>, InstructionError> {
    let started = Instant::now();
    match payload.mode {
        WaitMode::Time => {
            tokio::time::sleep(secs(payload.seconds.unwrap_or_default())).await;
        }
        WaitMode::Element | WaitMode::Visible => {
            let name = payload.element_name.as_deref().unwrap_or_default();
            if !ctx.registry.contains(name) {
                return Err(InstructionError::ElementNotFound(format!(
                    "'{}' is not registered",
                    name
                )));
            }
            let need_visible = payload.mode == WaitMode::Visible;
            let found = poll_until(ctx, timeout, || async move {
                match ctx.try_resolve(name).await {
                    Some(node) if need_visible => ctx.locator.is_visible(node).await,
                    Some(_) => true,
                    None => false,
                }
            })
            .await;
            if !found {
                let what = if need_visible { "visible" } else { "present" };
                return Err(InstructionError::Timeout(format!(
                    "'{}' was not {} within {:?}",
                    name, what, timeout
                )));
            }
        }
        WaitMode::Condition | WaitMode::Function => {
            let script = payload.script.as_deref().unwrap_or_default();
            let kind = if payload.mode == WaitMode::Condition {
                PredicateKind::Expression
            } else {
                PredicateKind::Function
            };
            let held = poll_until(ctx, timeout, || async move {
                match ctx.document.evaluate_predicate(script, kind).await {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("Predicate error ignored: {}", e);
                        false
                    }
                }
            })
            .await;
            if !held {
                return Err(InstructionError::Timeout(format!(
                    "condition did not hold within {:?}",
                    timeout
                )));
            }
        }
        WaitMode::Network => {
            let settled = wait_for_network(ctx, timeout).await;
            return Ok(Some(json!({
                "settled": settled,
                "waitedMs": elapsed_ms(started),
            })));
        }
    }

    Ok(Some(json!({ "waitedMs": elapsed_ms(started) })))
}

/// Succeeds early once no resource load has been seen for a full settle
/// interval; otherwise gives up quietly at the timeout.
async fn wait_for_network(ctx: &ExecutionContext, timeout: Duration) -> bool {
    let settle = ctx.settings.network_settle();
    let deadline = deadline_after(timeout);
    let mut quiet_since: Option<Instant> = None;

    loop {
        let now = Instant::now();
        match ctx.document.pending_resources().await {
            Ok(0) => {
                let since = *quiet_since.get_or_insert(now);
                if now.duration_since(since) >= settle {
                    return true;
                }
            }
            Ok(pending) => {
                debug!("{} resources still loading", pending);
                quiet_since = None;
            }
            Err(e) => {
                debug!("Pending resource probe failed: {}", e);
                quiet_since = None;
            }
        }

        if now >= deadline {
            debug!("Network did not settle within {:?}, continuing", timeout);
            return false;
        }
        tokio::time::sleep(ctx.settings.poll_interval()).await;
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
