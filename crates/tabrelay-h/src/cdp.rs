use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tabrelay_engine::config::BrowserSettings;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Page error: {0}")]
    Page(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A launched Chromium with its CDP handler task.
pub struct ChromeBrowser {
    browser: Browser,
    handler_task: JoinHandle<()>,
    user_data_dir: PathBuf,
    cleanup_user_data_dir: bool,
}

impl ChromeBrowser {
    pub async fn launch(settings: &BrowserSettings) -> Result<Self, BrowserError> {
        let mut config_builder = BrowserConfig::builder().no_sandbox();
        let (user_data_dir, cleanup_user_data_dir) = resolve_user_data_dir()?;
        config_builder = config_builder.user_data_dir(&user_data_dir);

        if settings.visible {
            info!("Launching browser in visible mode");
            config_builder = config_builder.with_head();
        } else {
            info!("Launching browser in headless mode");
        }

        let chrome_bin = settings
            .chrome_bin
            .clone()
            .or_else(|| std::env::var_os("CHROME_BIN").map(PathBuf::from));
        if let Some(chrome_bin) = chrome_bin {
            info!("Using custom Chrome binary: {}", chrome_bin.display());
            config_builder = config_builder.chrome_executable(chrome_bin);
        }

        let config = config_builder
            .build()
            .map_err(|e| BrowserError::Launch(format!("invalid browser config: {}", e)))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    error!("Browser handler error (ignoring): {}", e);
                }
            }
            info!("Browser handler task ended");
        });

        Ok(Self {
            browser,
            handler_task,
            user_data_dir,
            cleanup_user_data_dir,
        })
    }

    /// Open a page at `url` with console logging and dialog auto-accept.
    pub async fn open_page(&self, url: &str) -> Result<Page, BrowserError> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| BrowserError::Page(format!("failed to create page: {}", e)))?;
        watch_page(&page).await?;
        Ok(page)
    }

    pub async fn close(mut self) -> Result<(), BrowserError> {
        self.browser
            .close()
            .await
            .map_err(|e| BrowserError::Launch(format!("error closing browser: {}", e)))?;
        if let Err(e) = self.handler_task.await {
            warn!("Browser handler task failed: {}", e);
        }

        if self.cleanup_user_data_dir
            && let Err(e) = std::fs::remove_dir_all(&self.user_data_dir)
        {
            debug!(
                "Failed to clean up user-data-dir {}: {}",
                self.user_data_dir.display(),
                e
            );
        }
        Ok(())
    }
}

async fn watch_page(page: &Page) -> Result<(), BrowserError> {
    let mut console_events = page
        .event_listener::<EventConsoleApiCalled>()
        .await
        .map_err(|e| BrowserError::Page(format!("console subscription failed: {}", e)))?;
    tokio::spawn(async move {
        while let Some(event) = console_events.next().await {
            let args: Vec<String> = event
                .args
                .iter()
                .map(|arg| arg.description.clone().unwrap_or_else(|| "unknown".into()))
                .collect();
            debug!("Browser Console [{:?}]: {}", event.r#type, args.join(" "));
        }
    });

    // Dialogs block the JS thread; accept them so bridge calls keep flowing.
    let mut dialog_events = page
        .event_listener::<EventJavascriptDialogOpening>()
        .await
        .map_err(|e| BrowserError::Page(format!("dialog subscription failed: {}", e)))?;
    let page = page.clone();
    tokio::spawn(async move {
        while let Some(event) = dialog_events.next().await {
            info!(
                "Handling JavaScript Dialog: {} ({:?})",
                event.message, event.r#type
            );
            if let Err(e) = page.execute(HandleJavaScriptDialogParams::new(true)).await {
                error!("Failed to accept dialog: {}", e);
            }
        }
    });

    Ok(())
}

fn resolve_user_data_dir() -> Result<(PathBuf, bool), BrowserError> {
    if let Ok(dir) = std::env::var("TABRELAY_USER_DATA_DIR") {
        let path = PathBuf::from(dir);
        std::fs::create_dir_all(&path)?;
        info!("Using user data dir from TABRELAY_USER_DATA_DIR: {}", path.display());
        return Ok((path, false));
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let unique = format!("tabrelay-chromium-profile-{}-{}", std::process::id(), nanos);
    let path = std::env::temp_dir().join(unique);
    std::fs::create_dir_all(&path)?;
    debug!("Using isolated user data dir: {}", path.display());
    Ok((path, true))
}
