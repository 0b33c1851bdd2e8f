//! RELAYMUX command-line interface.
//!
//! Runs a relay server, or a relay client that either pipes stdio through a
//! virtual connection or echoes everything it receives.

use anyhow::Context;
use clap::{Parser, Subcommand};
use relaymux_core::{PeerId, RelayClient, RelayServer, VirtualConn};
use relaymux_transport::{
    DatagramDialer, DatagramListener, Dialer, EndpointCache, Listener, StreamDialer,
    StreamListener,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

mod config;
use config::{Config, TransportName};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// RELAYMUX - peer-to-peer byte streams through a relay server
#[derive(Parser)]
#[command(name = "relaymux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Server {
        /// Listen address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Transport to serve (overrides config)
        #[arg(short, long, value_enum)]
        transport: Option<TransportName>,
    },

    /// Pipe stdin/stdout through a virtual connection to a remote peer.
    ///
    /// Stdin EOF stops sending; the pipe ends once the remote peer closes
    /// its end or on Ctrl-C.
    Pipe {
        /// Local peer id to register
        #[arg(short, long)]
        peer_id: String,

        /// Remote peer id to connect to
        #[arg(short, long)]
        remote: String,

        /// Relay server address (overrides config)
        #[arg(short, long)]
        server: Option<String>,

        /// Transport to the relay (overrides config)
        #[arg(short, long, value_enum)]
        transport: Option<TransportName>,
    },

    /// Accept virtual connections and echo back everything received
    Echo {
        /// Local peer id to register
        #[arg(short, long)]
        peer_id: String,

        /// Relay server address (overrides config)
        #[arg(short, long)]
        server: Option<String>,

        /// Transport to the relay (overrides config)
        #[arg(short, long, value_enum)]
        transport: Option<TransportName>,
    },

    /// Print the effective configuration, secrets masked
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load_or_default()?,
    };

    // Command-line overrides
    match &cli.command {
        Commands::Server { bind, transport } => {
            if let Some(bind) = bind {
                config.server.bind_addr.clone_from(bind);
            }
            if let Some(transport) = transport {
                config.server.transport = *transport;
            }
        }
        Commands::Pipe {
            server, transport, ..
        }
        | Commands::Echo {
            server, transport, ..
        } => {
            if let Some(server) = server {
                config.client.server_addr.clone_from(server);
            }
            if let Some(transport) = transport {
                config.client.transport = *transport;
            }
        }
        Commands::Config => {}
    }

    config.validate()?;

    // Stdout carries piped data, logs go to stderr
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Server { .. } => run_server(&config).await,
        Commands::Pipe {
            peer_id, remote, ..
        } => run_pipe(&config, &peer_id, &remote).await,
        Commands::Echo { peer_id, .. } => run_echo(&config, &peer_id).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}

/// Run the relay server until Ctrl-C
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let server = RelayServer::with_config(config.server_config());
    let addr = config.server.bind_addr.as_str();

    let listener: Arc<dyn Listener> = match config.server.transport {
        TransportName::Tcp => Arc::new(StreamListener::bind(addr).await?),
        TransportName::Datagram => Arc::new(
            DatagramListener::bind_with(
                addr,
                config.session_key()?,
                config.datagram_config(),
                Arc::new(EndpointCache::new()),
            )
            .await?,
        ),
    };

    info!(
        "Starting relay server on {} ({})",
        listener.local_addr()?,
        config.server.transport
    );

    let serve = server.listen_on(listener);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down relay server");
            server.close().await?;
            serve.await?;
        }
    }

    Ok(())
}

fn build_dialer(config: &Config) -> anyhow::Result<Arc<dyn Dialer>> {
    Ok(match config.client.transport {
        TransportName::Tcp => Arc::new(StreamDialer::new()),
        TransportName::Datagram => Arc::new(DatagramDialer::with_config(
            config.session_key()?,
            config.datagram_config(),
            Arc::new(EndpointCache::new()),
        )),
    })
}

async fn connect_client(config: &Config, peer_id: &str) -> anyhow::Result<RelayClient> {
    let peer_id = PeerId::new(peer_id)?;
    let client = RelayClient::with_config(
        config.client.server_addr.clone(),
        peer_id,
        config.client_config(),
        build_dialer(config)?,
    );

    client
        .connect()
        .await
        .with_context(|| format!("failed to register with {}", config.client.server_addr))?;

    info!(
        "Registered as {} with relay {}",
        client.peer_id(),
        client.server_addr()
    );
    Ok(client)
}

/// Copy stdin into a virtual connection and the connection into stdout
/// until the remote peer closes
async fn run_pipe(config: &Config, peer_id: &str, remote: &str) -> anyhow::Result<()> {
    let remote = PeerId::new(remote)?;
    let client = connect_client(config, peer_id).await?;
    let conn = client.open_conn(&remote)?;

    let upstream = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            loop {
                let n = stdin.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                conn.write(&buf[..n]).await?;
            }
            anyhow::Ok(())
        })
    };

    let downstream = async {
        let mut stdout = tokio::io::stdout();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n]).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    };

    let result = tokio::select! {
        result = downstream => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    upstream.abort();
    client.close().await?;
    result
}

/// Echo every accepted virtual connection until Ctrl-C
async fn run_echo(config: &Config, peer_id: &str) -> anyhow::Result<()> {
    let client = connect_client(config, peer_id).await?;

    loop {
        let conn = tokio::select! {
            accepted = client.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => break,
        };

        info!("Echoing for {}", conn.remote_peer());
        tokio::spawn(async move {
            if let Err(e) = echo(&conn).await {
                warn!("Echo for {} ended: {}", conn.remote_peer(), e);
            }
        });
    }

    client.close().await?;
    Ok(())
}

async fn echo(conn: &VirtualConn) -> relaymux_core::Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return conn.close().await;
        }
        conn.write(&buf[..n]).await?;
    }
}
