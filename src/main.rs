use anyhow::{Context as _, Result};
use arc_swap::ArcSwap;
use clap::{Args, Parser, Subcommand};
use secrecy::{ExposeSecret as _, SecretString};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use stowage_auth::{
    AttemptOutcome, Broker, BusOpener, CallbackHandler, CredentialStaging, FailureReporter,
    HttpTokenExchange, RedirectPolicy, StartOptions, StateTokens, SystemBrowser,
};
use stowage_config::{Config, ConfigWatcher, LogConfig, LogFormat};
use stowage_store::SqliteStore;
use stowage_types::{KeyValueStore, Provider, TokenExchange};
use stowage_web::AppState;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing_subscriber::EnvFilter;

/// Sweep interval for staged entries left behind by crashed attempts.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "stowage", about = "stowage: storage-provider authorization broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Common {
    /// Path to the YAML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// SQLite staging database (default: ~/.stowage/staging.db).
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the callback server.
    Serve {
        #[command(flatten)]
        common: Common,
        /// Override the listening port (default: 3000).
        #[arg(short, long)]
        port: Option<u16>,
        /// Override the listening address (default: 127.0.0.1).
        #[arg(long)]
        host: Option<String>,
    },
    /// Connect a storage provider.
    Link {
        /// Provider name (dropbox / google_drive).
        provider: String,
        /// OAuth client id of the app registered with the provider.
        #[arg(long)]
        client_id: String,
        /// OAuth client secret of the app registered with the provider.
        #[arg(long)]
        client_secret: String,
        #[command(flatten)]
        common: Common,
    },
    /// Finish an authorization from a copied callback URL.
    Complete {
        /// Provider name.
        provider: String,
        /// The callback URL shown on the provider's redirect page.
        callback_url: String,
        #[command(flatten)]
        common: Common,
    },
    /// Show providers with an authorization in progress.
    Status {
        #[command(flatten)]
        common: Common,
    },
    /// Discard the authorization in progress for a provider.
    Cancel {
        /// Provider name.
        provider: String,
        #[command(flatten)]
        common: Common,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { common, port, host } => cmd_serve(common, port, host).await,
        Commands::Link {
            provider,
            client_id,
            client_secret,
            common,
        } => cmd_link(&provider, client_id, SecretString::from(client_secret), common).await,
        Commands::Complete {
            provider,
            callback_url,
            common,
        } => cmd_complete(&provider, &callback_url, common).await,
        Commands::Status { common } => cmd_status(common).await,
        Commands::Cancel { provider, common } => cmd_cancel(&provider, common).await,
    }
}

async fn cmd_serve(common: Common, port: Option<u16>, host: Option<String>) -> Result<()> {
    let (config, watcher) = match &common.config {
        Some(path) => {
            let watcher = Arc::new(
                ConfigWatcher::new(path.clone()).map_err(|e| anyhow::anyhow!("config error: {e}"))?,
            );
            (watcher.arc(), Some(watcher))
        }
        None => (Arc::new(ArcSwap::from_pointee(load_config(None)?)), None),
    };
    let snapshot = config.load_full();
    init_tracing(&snapshot.log);

    let mut addr_config = (*snapshot).clone();
    if let Some(p) = port {
        addr_config.port = p;
    }
    if let Some(h) = host {
        addr_config.host = h;
    }
    let addr = addr_config.listen_addr();

    let store = Arc::new(open_store(common.db.as_deref(), &snapshot).await?);
    match snapshot.purge_after() {
        Some(max_age) => spawn_purge(Arc::clone(&store), max_age),
        None => tracing::info!("attempt timeout disabled, staged entries are never swept"),
    }
    if let Some(watcher) = watcher {
        watcher.watch();
    }

    let state = AppState::new(config, store, exchange_for(&snapshot));
    let app = stowage_web::make_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    eprintln!("stowage listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn cmd_link(
    provider_str: &str,
    client_id: String,
    client_secret: SecretString,
    common: Common,
) -> Result<()> {
    let provider = parse_provider(provider_str)?;
    let config = load_config(common.config.as_deref())?;
    init_tracing(&config.log);

    let store: Arc<dyn KeyValueStore> = Arc::new(open_store(common.db.as_deref(), &config).await?);
    let exchange = exchange_for(&config);
    let browser = Arc::new(SystemBrowser::new());
    let broker = Broker::from_config(
        &config,
        Arc::clone(&store),
        browser.clone(),
        Arc::clone(&exchange),
    );

    // Serve the callback page in-process so it can relay straight to us.
    let opener = BusOpener::new(broker.bus().clone(), broker.origin());
    let state = AppState::new(Arc::new(ArcSwap::from_pointee(config.clone())), store, exchange)
        .with_opener(Arc::new(opener));
    let app = stowage_web::make_router(Arc::new(state));
    match tokio::net::TcpListener::bind(config.listen_addr()).await {
        Ok(listener) => {
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::warn!(error = %e, "callback server stopped");
                }
            });
        }
        Err(e) => {
            tracing::warn!(addr = %config.listen_addr(), error = %e, "callback server not started, paste the callback URL instead");
        }
    }

    let options = StartOptions::builder()
        .provider(provider)
        .client_id(client_id)
        .client_secret(client_secret)
        .build();
    let mut attempt = broker.start(options).await?;
    let url = attempt.authorization_url()?;
    eprintln!("Opening {provider} consent page:\n  {url}");
    attempt
        .open_auth_window(&url)
        .await
        .context("could not open a browser window for the consent page")?;

    let closer = Arc::clone(&browser);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            closer.close_current();
        }
    });
    spawn_paste_reader(provider, broker.handler(), attempt.failure_reporter());
    eprintln!("Waiting for authorization. Paste the callback URL here if the page asks you to.");

    match attempt.resolve().await {
        AttemptOutcome::Succeeded { access_token, .. } => {
            eprintln!("{provider} connected");
            println!("{}", access_token.expose_secret());
            Ok(())
        }
        outcome => Err(anyhow::anyhow!(
            "{provider} authorization did not complete: {}",
            outcome
                .into_result()
                .err()
                .map_or_else(String::new, |e| e.to_string())
        )),
    }
}

/// Read a pasted callback URL (or in-process `code=…&state=…` response) from
/// stdin and redeem it. The token reaches the waiting attempt through the
/// staging store; a failure ends the attempt with its own classification.
fn spawn_paste_reader(provider: Provider, handler: CallbackHandler, reporter: FailureReporter) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = handler.complete_manually(provider, line).await {
                eprintln!("manual completion failed: {e}");
                reporter.report(e);
            }
            break;
        }
    });
}

async fn cmd_complete(provider_str: &str, callback_url: &str, common: Common) -> Result<()> {
    let provider = parse_provider(provider_str)?;
    let config = load_config(common.config.as_deref())?;
    init_tracing(&config.log);

    let store = Arc::new(open_store(common.db.as_deref(), &config).await?);
    let handler = CallbackHandler::new(
        store,
        exchange_for(&config),
        RedirectPolicy::new(config.redirects.clone()),
        config.origin.clone(),
    );
    let token = handler
        .complete_manually(provider, callback_url)
        .await
        .map_err(|e| anyhow::anyhow!("authorization failed: {e}"))?;
    eprintln!("{provider} connected");
    println!("{}", token.expose_secret());
    Ok(())
}

async fn cmd_status(common: Common) -> Result<()> {
    let config = load_config(common.config.as_deref())?;
    let store = Arc::new(open_store(common.db.as_deref(), &config).await?);
    let tokens = StateTokens::new(store.clone());
    let staging = CredentialStaging::new(store);
    for &provider in Provider::all() {
        let status = if tokens.peek(provider).await?.is_some() {
            "authorization pending"
        } else if staging.is_staged(provider).await? {
            "credentials staged"
        } else {
            "idle"
        };
        println!("{provider}: {status}");
    }
    Ok(())
}

async fn cmd_cancel(provider_str: &str, common: Common) -> Result<()> {
    let provider = parse_provider(provider_str)?;
    let config = load_config(common.config.as_deref())?;
    let store = Arc::new(open_store(common.db.as_deref(), &config).await?);
    StateTokens::new(store.clone()).invalidate(provider).await?;
    CredentialStaging::new(store).clear(provider).await?;
    eprintln!("{provider} authorization discarded");
    Ok(())
}

fn parse_provider(s: &str) -> Result<Provider> {
    s.parse::<Provider>()
        .map_err(|e| anyhow::anyhow!("unknown provider '{s}': {e}"))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path).map_err(|e| anyhow::anyhow!("config error: {e}"))
}

fn init_tracing(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn exchange_for(config: &Config) -> Arc<dyn TokenExchange> {
    Arc::new(HttpTokenExchange::new(
        reqwest::Client::new(),
        config.exchange_url.clone(),
    ))
}

fn spawn_purge(store: Arc<SqliteStore>, max_age: Duration) {
    let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match store.purge_older_than(max_age).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "purged stale staged entries"),
                Err(e) => tracing::warn!(error = %e, "failed to purge staged entries"),
            }
        }
    });
}

async fn open_store(db: Option<&Path>, config: &Config) -> Result<SqliteStore> {
    let path = db
        .map(Path::to_path_buf)
        .or_else(|| config.db.clone())
        .unwrap_or_else(default_db_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let url = format!("sqlite://{}", path.display());
    SqliteStore::new(&url)
        .await
        .map_err(|e| anyhow::anyhow!("database error: {e}"))
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".stowage").join("staging.db")
}
