//! The dispatch loop.
//!
//! Each cycle pulls work from the remote task server when nothing is
//! pending locally, runs coordinator-local tasks, queues instructions per
//! target, and nudges every target with pending work to come and drain it.
//! The dispatcher is also the [`RequestHandler`] for everything contexts send.

use crate::hub::{ContextChannel, RequestHandler};
use crate::identity::{IdentityError, IdentityStore};
use crate::queue::InstructionQueue;
use crate::registry::ConnectionRegistry;
use crate::task_server::{TaskServer, TaskServerError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tabrelay_common::error::TransportError;
use tabrelay_common::launcher::TargetLauncher;
use tabrelay_common::protocol::{ContextRequest, ContextResponse, TargetId};
use tabrelay_common::task::{
    CoordinatorTask, FetchRequest, IdentityPatch, NodeIdentity, ReplyRequest, TargetSummary,
    TaskKind,
};
use tabrelay_engine::config::DispatcherSettings;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Task server error: {0}")]
    TaskServer(#[from] TaskServerError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotifyFailure {
    pub target: TargetId,
    pub reason: String,
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// The previous cycle was still running, nothing was done.
    pub skipped: bool,
    pub swept: usize,
    pub fetched: bool,
    pub tasks_run: usize,
    pub enqueued: usize,
    pub notified: Vec<TargetId>,
    pub failures: Vec<NotifyFailure>,
}

impl CycleReport {
    /// A cycle that had targets to notify succeeded only if one of them was
    /// reached.
    pub fn is_success(&self) -> bool {
        if self.skipped {
            return false;
        }
        let attempted = self.notified.len() + self.failures.len();
        attempted == 0 || !self.notified.is_empty()
    }
}

pub struct Dispatcher {
    queue: Arc<InstructionQueue>,
    registry: Arc<ConnectionRegistry>,
    channel: Arc<dyn ContextChannel>,
    server: Arc<dyn TaskServer>,
    identity: Arc<dyn IdentityStore>,
    launcher: Option<Arc<dyn TargetLauncher>>,
    settings: DispatcherSettings,
    cycle_guard: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<InstructionQueue>,
        registry: Arc<ConnectionRegistry>,
        channel: Arc<dyn ContextChannel>,
        server: Arc<dyn TaskServer>,
        identity: Arc<dyn IdentityStore>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            queue,
            registry,
            channel,
            server,
            identity,
            launcher: None,
            settings,
            cycle_guard: Mutex::new(()),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn TargetLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn queue(&self) -> &Arc<InstructionQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Run cycles on the configured interval until the task is dropped.
    /// A tick that lands while a cycle is still going is skipped.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Dispatch loop started ({:?} interval)", self.settings.interval());

        loop {
            interval.tick().await;
            let dispatcher = self.clone();
            tokio::spawn(async move {
                match dispatcher.run_cycle().await {
                    Ok(report) if report.skipped => {}
                    Ok(report) => debug!("Cycle finished: {:?}", report),
                    Err(e) => error!("Dispatch cycle aborted: {}", e),
                }
            });
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, DispatchError> {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            warn!("Previous dispatch cycle still running, skipping");
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        };

        let mut report = CycleReport {
            swept: self
                .queue
                .sweep_expired(Duration::from_millis(self.settings.queue_max_age_ms)),
            ..CycleReport::default()
        };
        if report.swept > 0 {
            info!("Swept {} expired instructions", report.swept);
        }

        let (identity, token) = self.authenticate().await?;

        let pending = self.queue.total_pending();
        if pending > 0 {
            debug!("{} instructions pending, skipping fetch", pending);
        } else {
            self.fetch_work(&identity, &token, &mut report).await?;
        }

        self.notify_pending(&mut report).await;

        if !report.failures.is_empty() {
            self.relay_failures(&identity, &token, &report.failures)
                .await;
        }

        Ok(report)
    }

    /// The cached credential, logging in first when there is none.
    async fn authenticate(&self) -> Result<(NodeIdentity, String), DispatchError> {
        let identity = self.identity.get_or_create_identity().await?;
        if let Some(token) = identity.token.clone() {
            return Ok((identity, token));
        }

        info!("Logging in as {}", identity.name);
        let token = match self.server.login(&identity).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Login failed: {}", e);
                return Err(e.into());
            }
        };
        let identity = self
            .identity
            .update_identity(&IdentityPatch::token(token.clone()))
            .await?;
        Ok((identity, token))
    }

    /// Drop the cached credential when the server refused a call.
    async fn check_rejection(&self, err: &TaskServerError) {
        if err.is_rejection() {
            warn!("Task server rejected the credential, clearing it");
            if let Err(e) = self
                .identity
                .update_identity(&IdentityPatch::clear_token())
                .await
            {
                error!("Failed to clear credential: {}", e);
            }
        }
    }

    fn target_summaries(&self) -> Vec<TargetSummary> {
        self.registry
            .stats()
            .into_iter()
            .map(|record| TargetSummary {
                pending: self.queue.count(&record.target),
                target: record.target,
                index: record.index,
                url: record.url,
            })
            .collect()
    }

    async fn fetch_work(
        &self,
        identity: &NodeIdentity,
        token: &str,
        report: &mut CycleReport,
    ) -> Result<(), DispatchError> {
        let request = FetchRequest {
            identity: identity.public(),
            targets: self.target_summaries(),
        };
        let work = match self.server.fetch(token, &request).await {
            Ok(work) => work,
            Err(e) => {
                self.check_rejection(&e).await;
                return Err(e.into());
            }
        };
        report.fetched = true;

        for task in &work.tasks {
            let payload = self.run_task(task).await;
            report.tasks_run += 1;
            let reply = ReplyRequest {
                identity: identity.public(),
                target: task.kind.target().cloned(),
                payload,
            };
            if let Err(e) = self.server.reply_task(token, &reply).await {
                warn!("Failed to reply to task {}: {}", task.id, e);
                self.check_rejection(&e).await;
            }
        }

        for batch in work.instructions {
            let added = self.queue.enqueue(&batch.target, batch.instructions);
            if added > 0 {
                debug!("Queued {} instructions for {}", added, batch.target);
            }
            report.enqueued += added;
        }

        if report.enqueued > 0 || report.tasks_run > 0 {
            info!(
                "Fetched {} instructions and {} tasks",
                report.enqueued, report.tasks_run
            );
        }
        Ok(())
    }

    /// Execute one coordinator-local task, producing the reply payload.
    async fn run_task(&self, task: &CoordinatorTask) -> Value {
        let outcome: Result<Value, String> = match &task.kind {
            TaskKind::SpawnTarget { target, url } => match &self.launcher {
                Some(launcher) => launcher
                    .spawn(target, url)
                    .await
                    .map(|_| json!({ "target": target, "url": url }))
                    .map_err(|e| e.to_string()),
                None => Err("no target launcher configured".to_string()),
            },
            TaskKind::ClearQueue { target } => {
                let cleared = self.queue.clear(target);
                Ok(json!({ "target": target, "cleared": cleared }))
            }
            TaskKind::SweepExpired { max_age_ms } => {
                let max_age = max_age_ms.unwrap_or(self.settings.queue_max_age_ms);
                let removed = self.queue.sweep_expired(Duration::from_millis(max_age));
                Ok(json!({ "removed": removed }))
            }
            TaskKind::ReportConnections => Ok(json!({
                "connections": self.registry.stats(),
                "queues": self.queue.stats_all(),
            })),
        };

        match outcome {
            Ok(result) => json!({ "taskId": task.id, "ok": true, "result": result }),
            Err(error) => {
                warn!("Task {} failed: {}", task.id, error);
                json!({ "taskId": task.id, "ok": false, "error": error })
            }
        }
    }

    async fn notify_pending(&self, report: &mut CycleReport) {
        let targets: Vec<TargetId> = self
            .queue
            .stats_all()
            .into_iter()
            .map(|stats| stats.target)
            .collect();

        let outcomes = futures::future::join_all(
            targets
                .iter()
                .map(|target| async move { (target.clone(), self.notify_target(target).await) }),
        )
        .await;

        for (target, outcome) in outcomes {
            match outcome {
                Ok(()) => report.notified.push(target),
                Err(reason) => {
                    warn!("Could not notify {}: {}", target, reason);
                    report.failures.push(NotifyFailure { target, reason });
                }
            }
        }
    }

    async fn notify_target(&self, target: &TargetId) -> Result<(), String> {
        if !self.registry.is_connected(target) && !self.restore_record(target).await {
            return Err("no connection record".into());
        }
        if !self.channel.has_context(target) {
            self.registry.remove(target);
            return Err("context no longer exists".into());
        }

        let attempts = self.settings.notify_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.ping_then_notify(target).await {
                Ok(()) => {
                    self.registry.touch(target);
                    debug!("Notified {} (attempt {})", target, attempt);
                    return Ok(());
                }
                Err(TransportError::NoReceiver(_)) => {
                    self.registry.remove(target);
                    return Err("context no longer exists".into());
                }
                Err(e) => last_error = e.to_string(),
            }
            if attempt < attempts {
                debug!(
                    "Notify {} attempt {}/{} failed: {}",
                    target, attempt, attempts, last_error
                );
                tokio::time::sleep(self.settings.notify_backoff(attempt)).await;
            }
        }

        self.registry.remove(target);
        Err(format!(
            "notify failed after {} attempts: {}",
            attempts, last_error
        ))
    }

    /// One notify attempt: the context must answer a ping before it is told
    /// to drain.
    async fn ping_then_notify(&self, target: &TargetId) -> Result<(), TransportError> {
        let ping = self.channel.request(target, ContextRequest::Ping).await?;
        if !ping.ok {
            return Err(TransportError::Rejected(format!(
                "ping refused: {}",
                ping.error.unwrap_or_default()
            )));
        }
        let notify = self.channel.request(target, ContextRequest::Notify).await?;
        if !notify.ok {
            return Err(TransportError::Rejected(
                notify.error.unwrap_or_else(|| "notify refused".into()),
            ));
        }
        Ok(())
    }

    /// Rebuild the record of a context that is still attached to the hub,
    /// from what it reports about itself in a ping reply.
    async fn restore_record(&self, target: &TargetId) -> bool {
        if !self.channel.has_context(target) {
            return false;
        }
        let data = match self.channel.request(target, ContextRequest::Ping).await {
            Ok(ContextResponse {
                ok: true,
                data: Some(data),
                ..
            }) => data,
            Ok(_) => return false,
            Err(e) => {
                debug!("Could not restore record for {}: {}", target, e);
                return false;
            }
        };

        let index = data
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|i| u32::try_from(i).ok())
            .unwrap_or_default();
        let url = data.get("url").and_then(Value::as_str).unwrap_or_default();
        self.registry.record(target, index, url);
        info!("Restored connection record for {} (#{})", target, index);
        true
    }

    async fn relay_failures(&self, identity: &NodeIdentity, token: &str, failures: &[NotifyFailure]) {
        let reply = ReplyRequest {
            identity: identity.public(),
            target: None,
            payload: json!({ "type": "notifyFailures", "failures": failures }),
        };
        if let Err(e) = self.server.reply_instructions(token, &reply).await {
            warn!("Failed to relay notify failures: {}", e);
            self.check_rejection(&e).await;
        }
    }

    async fn relay_results(&self, target: &TargetId, payload: Value) -> Result<(), String> {
        let (identity, token) = self.authenticate().await.map_err(|e| e.to_string())?;
        let reply = ReplyRequest {
            identity: identity.public(),
            target: Some(target.clone()),
            payload,
        };
        match self.server.reply_instructions(&token, &reply).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.check_rejection(&e).await;
                Err(e.to_string())
            }
        }
    }

    /// Re-check a context after it navigated; drop it if it went away.
    fn schedule_probe(&self, target: &TargetId) {
        let target = target.clone();
        let channel = self.channel.clone();
        let registry = self.registry.clone();
        let grace = self.settings.probe_grace();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let gone = !channel.has_context(&target)
                || match channel.request(&target, ContextRequest::Ping).await {
                    Ok(ContextResponse { ok: true, .. }) => {
                        registry.touch(&target);
                        false
                    }
                    Err(TransportError::NoReceiver(_)) => true,
                    Ok(_) | Err(_) => {
                        debug!("Context {} slow to answer after navigation", target);
                        false
                    }
                };
            if gone {
                info!("Context {} did not survive navigation", target);
                registry.remove(&target);
            }
        });
    }
}

fn respond_with<T: Serialize>(value: Result<T, String>) -> ContextResponse {
    match value.and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())) {
        Ok(data) => ContextResponse::ok(Some(data)),
        Err(error) => ContextResponse::error(error),
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, from: &TargetId, request: ContextRequest) -> ContextResponse {
        debug!("{} -> {}", from, request.action());
        if !matches!(request, ContextRequest::ContextReady { .. }) {
            self.registry.touch(from);
        }

        match request {
            ContextRequest::ContextReady { target, index, url } => {
                self.registry.record(&target, index, &url);
                info!("Context {} ready (#{}) at {}", target, index, url);
                ContextResponse::ok(None)
            }
            ContextRequest::ContextNavigated { url } => {
                self.registry.update_url(from, &url);
                self.schedule_probe(from);
                ContextResponse::ok(None)
            }
            ContextRequest::GetSingleInstruction => {
                ContextResponse::ok(self.queue.drain_first(from))
            }
            ContextRequest::GetInstructions => {
                ContextResponse::ok(Some(Value::Array(self.queue.drain_all(from))))
            }
            ContextRequest::GetInstructionsCount => {
                ContextResponse::ok(Some(json!(self.queue.count(from))))
            }
            ContextRequest::GetNodeProfile => respond_with(
                self.identity
                    .get_or_create_identity()
                    .await
                    .map(|identity| identity.public())
                    .map_err(|e| e.to_string()),
            ),
            ContextRequest::UpdateNodeProfile { profile } => respond_with(
                self.identity
                    .update_identity(&IdentityPatch {
                        token: None,
                        clear_token: false,
                        ..profile
                    })
                    .await
                    .map(|identity| identity.public())
                    .map_err(|e| e.to_string()),
            ),
            ContextRequest::ReportResults { results, stats } => {
                info!(
                    "{} reported {} results ({} failed)",
                    from, stats.total, stats.failure
                );
                let payload = json!({ "type": "results", "results": results, "stats": stats });
                match self.relay_results(from, payload).await {
                    Ok(()) => ContextResponse::ok(None),
                    Err(e) => ContextResponse::error(e),
                }
            }
            other @ (ContextRequest::Ping
            | ContextRequest::Notify
            | ContextRequest::ExecuteInstructions { .. }) => ContextResponse::error(format!(
                "'{}' is not accepted by the dispatcher",
                other.action()
            )),
        }
    }

    async fn disconnected(&self, target: &TargetId) {
        if self.registry.remove(target).is_some() {
            debug!("Removed connection record for {}", target);
        }
    }
}

