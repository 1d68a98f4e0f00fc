use crate::cdp::ChromeBrowser;
use crate::document::CdpDocument;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tabrelay_common::launcher::{LaunchError, TargetLauncher};
use tabrelay_engine::agent::{Agent, AgentHandle};
use tabrelay_engine::config::EngineSettings;
use tabrelay_engine::context::ExecutionContext;
use tabrelay_engine::protocol::TargetId;
use tokio::sync::Mutex;
use tracing::info;

/// Opens one Chromium page per target and attaches an agent to it.
pub struct ChromeLauncher {
    browser: Arc<ChromeBrowser>,
    hub_url: String,
    settings: EngineSettings,
    timeout: Duration,
    next_index: AtomicU32,
    agents: Mutex<HashMap<TargetId, AgentHandle>>,
}

impl ChromeLauncher {
    /// `hub_url` is the dispatcher's websocket endpoint.
    pub fn new(
        browser: Arc<ChromeBrowser>,
        hub_url: impl Into<String>,
        settings: EngineSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            browser,
            hub_url: hub_url.into(),
            settings,
            timeout,
            next_index: AtomicU32::new(1),
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub async fn running(&self) -> Vec<TargetId> {
        let mut agents = self.agents.lock().await;
        agents.retain(|_, handle| !handle.is_finished());
        let mut targets: Vec<TargetId> = agents.keys().cloned().collect();
        targets.sort();
        targets
    }
}

#[async_trait]
impl TargetLauncher for ChromeLauncher {
    async fn spawn(&self, target: &TargetId, url: &str) -> Result<(), LaunchError> {
        let fail = |reason: String| LaunchError {
            target: target.to_string(),
            reason,
        };

        let mut agents = self.agents.lock().await;
        if agents.get(target).is_some_and(|handle| !handle.is_finished()) {
            info!("Target {} already running", target);
            return Ok(());
        }

        let page = self
            .browser
            .open_page(url)
            .await
            .map_err(|e| fail(e.to_string()))?;
        let document = Arc::new(CdpDocument::new(page));
        let context = ExecutionContext::new(document, self.settings.clone());
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);

        let handle = Agent::connect(&self.hub_url, target.clone(), index, context, self.timeout)
            .await
            .map_err(|e| fail(e.to_string()))?;
        info!("Spawned target {} (#{}) at {}", target, index, url);
        agents.insert(target.clone(), handle);
        Ok(())
    }
}
