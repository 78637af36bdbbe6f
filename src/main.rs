use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dirsync::{ClientEvent, ClientSettings, Server, ServerSettings, SyncClient};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve a directory tree to sync clients
    Serve {
        /// Server config file (TOML)
        #[arg(short, long, env = "DIRSYNC_SERVER_CONFIG")]
        config: Option<PathBuf>,
        /// Directory to serve; overrides the config file
        #[arg(long)]
        root: Option<PathBuf>,
        /// Listen address
        #[arg(long)]
        bind: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Shared scrambling secret
        #[arg(long, env = "DIRSYNC_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },
    /// Connect to a server and keep the configured targets in sync
    Sync {
        /// Client config file (TOML)
        #[arg(short, long, env = "DIRSYNC_CONFIG")]
        config: PathBuf,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List child folders of a remote path
    Folders {
        #[arg(short, long, env = "DIRSYNC_CONFIG")]
        config: PathBuf,
        /// Remote path; empty means the served root
        #[arg(default_value = "")]
        path: String,
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let default = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Serve {
            config,
            root,
            bind,
            port,
            secret,
        } => serve(config, root, bind, port, secret).await,
        Commands::Sync { config, json } => sync(config, json).await,
        Commands::Folders { config, path, json } => folders(config, path, json).await,
    }
}

async fn serve(
    config: Option<PathBuf>,
    root: Option<PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
    secret: Option<String>,
) -> Result<()> {
    let mut settings = match (&config, &root) {
        (Some(path), _) => ServerSettings::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        (None, Some(root)) => ServerSettings::new(root.clone()),
        (None, None) => anyhow::bail!("either --config or --root is required"),
    };
    if let Some(root) = root {
        settings.root = root;
    }
    if let Some(bind) = bind {
        settings.bind = bind;
    }
    if let Some(port) = port {
        settings.port = port;
    }
    if secret.is_some() {
        settings.secret = secret;
    }

    let server = Server::bind(settings).await?;
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            on_signal.cancel();
        }
    });
    server.run_until(shutdown).await?;
    Ok(())
}

async fn sync(config: PathBuf, json: bool) -> Result<()> {
    let settings = ClientSettings::load(&config)
        .with_context(|| format!("loading {}", config.display()))?;
    let (client, mut events) = SyncClient::new(settings);
    let mut backoff = BACKOFF_START;

    loop {
        match client.connect().await {
            Ok(()) => {
                backoff = BACKOFF_START;
                client.start()?;
            }
            Err(e) => {
                warn!("Connect failed: {}; retrying in {:?}", e, backoff);
                drain(&mut events, json);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        }

        // Print events until the connection drops.
        let interrupted = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break true,
                event = events.recv() => match event {
                    Some(ClientEvent::Disconnected) => {
                        print_event(&ClientEvent::Disconnected, json);
                        break false;
                    }
                    Some(event) => print_event(&event, json),
                    None => break true,
                },
            }
        };
        client.pause();
        if interrupted {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }

    client.disconnect();
    Ok(())
}

async fn folders(config: PathBuf, path: String, json: bool) -> Result<()> {
    let settings = ClientSettings::load(&config)
        .with_context(|| format!("loading {}", config.display()))?;
    let (client, mut events) = SyncClient::new(settings);
    client.connect().await?;
    client.query_folders(&path).await?;

    let answer = tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::FolderList { .. } | ClientEvent::Error(_) => return Some(event),
                ClientEvent::Disconnected => return None,
                _ => {}
            }
        }
        None
    })
    .await
    .context("no answer from server")?;

    client.disconnect();
    match answer {
        Some(ClientEvent::FolderList { folders, .. }) if !json => {
            for folder in folders {
                println!("{}", folder);
            }
            Ok(())
        }
        Some(ClientEvent::Error(msg)) => anyhow::bail!(msg),
        Some(event) => {
            print_event(&event, json);
            Ok(())
        }
        None => anyhow::bail!("connection closed before the folder list arrived"),
    }
}

fn drain(events: &mut UnboundedReceiver<ClientEvent>, json: bool) {
    while let Ok(event) = events.try_recv() {
        print_event(&event, json);
    }
}

fn print_event(event: &ClientEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Event not serializable: {}", e),
        }
        return;
    }

    match event {
        ClientEvent::Login { session_name } => {
            println!("{} logged in as {}", "✓".green(), session_name.bold())
        }
        ClientEvent::LoginFailed { reason } => {
            println!("{} login failed: {}", "✗".red(), reason)
        }
        ClientEvent::Disconnected => println!("{} disconnected", "!".yellow()),
        ClientEvent::FolderList { path, folders } => {
            println!("{} {}: {}", "▸".cyan(), path, folders.join(", "))
        }
        ClientEvent::Information(msg) => println!("{} {}", "i".blue(), msg),
        ClientEvent::Error(msg) => println!("{} {}", "✗".red(), msg),
        ClientEvent::FileSynced { path, size, .. } => {
            println!("{} {} ({} bytes)", "↓".green(), path, size)
        }
        ClientEvent::CycleComplete { folder } => {
            println!("{} {} up to date", "✓".green(), folder.bold())
        }
    }
}
