use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabrelay_engine::agent::Agent;
use tabrelay_engine::config::{ConfigLoader, TabrelayConfig};
use tabrelay_engine::context::ExecutionContext;
use tabrelay_engine::executor::Executor;
use tabrelay_engine::instruction::Instruction;
use tabrelay_engine::protocol::TargetId;
use tabrelay_h::cdp::ChromeBrowser;
use tabrelay_h::document::CdpDocument;
use tabrelay_h::launcher::ChromeLauncher;
use tabrelay_r::dispatcher::Dispatcher;
use tabrelay_r::hub::ContextHub;
use tabrelay_r::identity::FileIdentityStore;
use tabrelay_r::queue::InstructionQueue;
use tabrelay_r::registry::ConnectionRegistry;
use tabrelay_r::task_server::HttpTaskServer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tabrelay", version, about = "Browser instruction relay")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Configuration file (defaults to ./tabrelay.yaml, then ~/.tabrelay/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Launch the browser in visible mode (not headless)
    #[arg(long, global = true)]
    visible: bool,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the dispatcher: context hub, dispatch loop and a Chromium launcher
    Serve {
        /// WebSocket port contexts attach to
        #[arg(long)]
        port: Option<u16>,
        /// Base URL of the remote task server
        #[arg(long)]
        server_url: Option<String>,
        /// Dispatch cycle period in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Do not launch Chromium; spawnTarget tasks will fail
        #[arg(long)]
        no_browser: bool,
    },
    /// Open one page and attach it to a running dispatcher
    Attach {
        /// Dispatcher WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:9001")]
        hub: String,
        #[arg(long)]
        target: String,
        #[arg(long, default_value_t = 0)]
        index: u32,
        #[arg(long, default_value = "about:blank")]
        url: String,
    },
    /// Execute a JSON instruction list locally and print the results
    Run {
        /// File holding a JSON array of instructions
        #[arg(long)]
        file: PathBuf,
        /// Page to open before running
        #[arg(long, default_value = "about:blank")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries results.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigLoader::load_default().await?,
    };
    if args.visible {
        config.browser.visible = true;
    }

    match args.mode {
        Mode::Serve {
            port,
            server_url,
            interval_ms,
            no_browser,
        } => {
            if let Some(port) = port {
                config.dispatcher.listen_port = port;
            }
            if let Some(server_url) = server_url {
                config.dispatcher.server_url = server_url;
            }
            if let Some(interval_ms) = interval_ms {
                config.dispatcher.interval_ms = interval_ms;
            }
            serve(config, no_browser).await
        }
        Mode::Attach {
            hub,
            target,
            index,
            url,
        } => attach(config, &hub, TargetId::new(target), index, &url).await,
        Mode::Run { file, url } => run(config, &file, &url).await,
    }
}

async fn serve(config: TabrelayConfig, no_browser: bool) -> anyhow::Result<()> {
    let settings = config.dispatcher.clone();
    url::Url::parse(&settings.server_url)
        .with_context(|| format!("invalid task server URL {}", settings.server_url))?;

    let identity_path = match &settings.identity_path {
        Some(path) => path.clone(),
        None => FileIdentityStore::default_path()?,
    };
    info!("Identity file: {}", identity_path.display());

    let hub = ContextHub::new(settings.request_timeout());
    let server = HttpTaskServer::new(&settings.server_url, settings.request_timeout())?;
    let mut dispatcher = Dispatcher::new(
        Arc::new(InstructionQueue::new()),
        Arc::new(ConnectionRegistry::new()),
        Arc::new(hub.clone()),
        Arc::new(server),
        Arc::new(FileIdentityStore::new(identity_path)),
        settings.clone(),
    );

    let browser = if no_browser {
        None
    } else {
        Some(Arc::new(ChromeBrowser::launch(&config.browser).await?))
    };
    if let Some(browser) = &browser {
        let hub_url = format!("ws://127.0.0.1:{}", settings.listen_port);
        dispatcher = dispatcher.with_launcher(Arc::new(ChromeLauncher::new(
            browser.clone(),
            hub_url,
            config.engine.clone(),
            settings.request_timeout(),
        )));
    }

    let dispatcher = Arc::new(dispatcher);
    let (addr, accept) = hub.start(settings.listen_port, dispatcher.clone()).await?;
    info!("Contexts attach at ws://{}", addr);
    let dispatch = tokio::spawn(dispatcher.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    dispatch.abort();
    accept.abort();

    if let Some(browser) = browser {
        match Arc::try_unwrap(browser) {
            Ok(browser) => browser.close().await?,
            Err(_) => warn!("Browser still in use, leaving it to exit with the process"),
        }
    }
    Ok(())
}

async fn attach(
    config: TabrelayConfig,
    hub: &str,
    target: TargetId,
    index: u32,
    url: &str,
) -> anyhow::Result<()> {
    url::Url::parse(hub).with_context(|| format!("invalid hub URL {}", hub))?;

    let browser = ChromeBrowser::launch(&config.browser).await?;
    let page = browser.open_page(url).await?;
    let context = ExecutionContext::new(Arc::new(CdpDocument::new(page)), config.engine.clone());

    let handle = Agent::connect(
        hub,
        target.clone(),
        index,
        context,
        config.dispatcher.request_timeout(),
    )
    .await?;
    info!("Attached {} to {}", target, hub);

    tokio::select! {
        _ = handle.closed() => info!("Dispatcher closed the channel"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    browser.close().await?;
    Ok(())
}

async fn run(config: TabrelayConfig, file: &Path, url: &str) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let instructions: Vec<Instruction> =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;
    if instructions.is_empty() {
        bail!("{} holds no instructions", file.display());
    }

    let browser = ChromeBrowser::launch(&config.browser).await?;
    let page = browser.open_page(url).await?;
    let context = ExecutionContext::new(Arc::new(CdpDocument::new(page)), config.engine.clone());

    let mut executor = Executor::with_instructions(context, instructions);
    let results = executor.execute_all().await.to_vec();
    if executor.halted_on_navigation() {
        info!("Stopped after navigation at instruction {}", results.len());
    }

    let output = json!({ "results": results, "stats": executor.stats() });
    println!("{}", serde_json::to_string_pretty(&output)?);

    browser.close().await?;
    Ok(())
}
