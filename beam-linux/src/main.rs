// Beam for Linux: LAN discovery, host/client transport, texts and files.

mod client;
mod config;
mod connection;
mod discovery;
mod events;
mod files;
mod host;
mod messenger;
mod session;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use beam_core::scheduler::Timer;
use beam_core::BeamCore;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::client::ReconnectingClient;
use crate::config::Settings;
use crate::discovery::DiscoveryControl;
use crate::events::{DownloadDir, EventSink, LogEvents};
use crate::host::{HostHandler, HostRegistry};
use crate::messenger::{FileMode, Messenger};
use crate::session::{Session, TokioTimer};

#[derive(Debug, Parser)]
#[command(name = "beam", version, about = "Send texts and files between devices on the same LAN")]
struct Cli {
    /// Config file (default: ~/.config/beam/config.toml, then /etc/beam/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Accept clients and announce this machine on the LAN.
    Host,
    /// Find a host by its broadcasts, or connect to one directly.
    Client {
        /// Host IP; disables discovery.
        #[arg(long, value_name = "IP")]
        connect: Option<IpAddr>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = config::load(cli.config.as_deref())?.resolve()?;
    info!(
        device_id = %settings.identity.device_id,
        device_name = %settings.identity.device_name,
        downloads = %settings.download_dir.display(),
        "starting beam {}",
        env!("CARGO_PKG_VERSION")
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.mode, settings))
}

async fn run(mode: Mode, settings: Settings) -> anyhow::Result<()> {
    let core = Arc::new(Mutex::new(BeamCore::new(settings.identity.clone())));
    let events: Arc<dyn EventSink> = Arc::new(LogEvents);
    let resolver = Arc::new(DownloadDir::new(settings.download_dir.clone()));
    let session = Session::new(core, events.clone(), resolver);
    let timer: Arc<dyn Timer> = Arc::new(TokioTimer);

    match mode {
        Mode::Host => {
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, settings.transport_port))
                .await
                .with_context(|| format!("binding transport port {}", settings.transport_port))?;
            let registry = Arc::new(HostRegistry::new(events));
            let handler = Arc::new(HostHandler::new(session, registry.clone()));
            let messenger = Messenger::new(registry.clone(), handler.session(), timer);
            let accept = tokio::spawn(host::run_host(listener, handler));
            let beacon = tokio::spawn(discovery::run_beacon(settings.discovery_port));

            tokio::select! {
                r = command_loop(&messenger) => r?,
                r = shutdown_signal() => r?,
            }
            info!("shutting down host");
            registry.shutdown().await;
            accept.abort();
            beacon.abort();
        }
        Mode::Client { connect } => {
            let port = settings.transport_port;
            let client = ReconnectingClient::new(session, settings.identity.clone(), timer.clone());
            let messenger = Messenger::new(client.clone(), client.session(), timer);
            let control = Arc::new(DiscoveryControl::new());
            if let Some(ip) = connect {
                control.suppress();
                client.begin_connecting(SocketAddr::new(ip, port)).await;
            }
            let socket = discovery::bind_listener(settings.discovery_port)
                .with_context(|| format!("binding discovery port {}", settings.discovery_port))?;
            let found = client.clone();
            let listen = tokio::spawn(discovery::run_listener(socket, control, move |ip| {
                let client = found.clone();
                async move { client.begin_connecting(SocketAddr::new(ip, port)).await }
            }));

            tokio::select! {
                r = command_loop(&messenger) => r?,
                r = shutdown_signal() => r?,
            }
            info!("shutting down client");
            client.stop().await;
            listen.abort();
        }
    }
    Ok(())
}

/// One line of operator input.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Empty,
    Quit,
    Status,
    File(&'a str, FileMode),
    Text(&'a str),
    Usage(&'static str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Command::Empty;
        }
        let file = |rest: &'a str, mode, usage| match rest.trim() {
            "" => Command::Usage(usage),
            path => Command::File(path, mode),
        };
        match trimmed {
            "/quit" => Command::Quit,
            "/status" => Command::Status,
            _ => {
                if let Some(rest) = trimmed.strip_prefix("/stream") {
                    if rest.is_empty() || rest.starts_with(' ') {
                        return file(rest, FileMode::Stream, "/stream PATH");
                    }
                }
                if let Some(rest) = trimmed.strip_prefix("/chunked") {
                    if rest.is_empty() || rest.starts_with(' ') {
                        return file(rest, FileMode::Chunked, "/chunked PATH");
                    }
                }
                Command::Text(line)
            }
        }
    }
}

/// Read commands from stdin until `/quit`. When stdin closes, keep running
/// until a signal arrives.
async fn command_loop(messenger: &Messenger) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => return Ok(()),
            Command::Status => {
                info!(
                    connections = messenger.connection_count().await,
                    pending = messenger.pending().await,
                    "status"
                );
            }
            Command::Usage(usage) => warn!("usage: {}", usage),
            Command::File(path, mode) => match messenger.send_file(Path::new(path), mode).await {
                Ok(name) => info!(file = %name, ?mode, "sending"),
                Err(e) => warn!(path, error = %e, "cannot send file"),
            },
            Command::Text(text) => match messenger.send_text(text).await {
                Ok(id) => debug!(message_id = %id, "text queued"),
                Err(e) => warn!(error = %e, "cannot send text"),
            },
        }
    }
    debug!("stdin closed");
    std::future::pending::<()>().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
