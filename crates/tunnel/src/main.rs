use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use httptunnel::{config, Address, ClientSettings, RelayClient, RelayServer};
use log::{info, warn};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "httptunnel",
    version,
    about = "Tunnel TCP connections through HTTP requests",
    long_about = "httptunnel\n\n\
        Carries TCP connections over a network that only permits outbound HTTP.\n\
        The relay owns the real sockets; the client maps each local connection\n\
        to a relay session.\n\n\
        Examples:\n  \
          # Run the relay\n  \
          httptunnel server -p 9999\n\n  \
          # Expose target 10.0.0.5:22 on local port 8889 through the relay\n  \
          httptunnel client 10.0.0.5:22 -p 8889 -r relay.example.com:9999"
)]
struct Args {
    /// Path to config file
    #[arg(long, short = 'C', global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay that owns sockets to tunnelled targets
    Server {
        /// Port the relay listens on (default 9999)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (default 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Accept local connections and tunnel them to a target through the relay
    Client {
        /// Target address in host:port form
        target: String,

        /// Port the tunnel listens on (default 8889)
        #[arg(short = 'p', long)]
        listen_port: Option<u16>,

        /// Relay address in host:port form (default localhost:9999)
        #[arg(short, long)]
        remote: Option<String>,

        /// Intermediate HTTP proxy in host:port form
        #[arg(short = 'o', long)]
        proxy: Option<String>,
    },
}

fn load_config(args: &Args) -> config::Config {
    if let Some(path) = &args.config {
        config::Config::load(path).unwrap_or_else(|e| {
            warn!(
                "Failed to load config from {:?}: {}. Using defaults.",
                path, e
            );
            config::Config::default()
        })
    } else {
        config::Config::load_or_default()
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Exiting...");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    let mut config = load_config(&args);

    match args.command {
        Command::Server { port, bind } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind;
            }

            let addr = format!("{}:{}", config.server.bind, config.server.port);
            info!("Starting relay on {}...", addr);

            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());
            RelayServer::new(&config).run(&addr, shutdown).await
        }
        Command::Client {
            target,
            listen_port,
            remote,
            proxy,
        } => {
            if let Some(port) = listen_port {
                config.client.listen_port = port;
            }
            if let Some(remote) = remote {
                config.client.remote = remote;
            }
            if proxy.is_some() {
                config.client.proxy = proxy;
            }

            let target: Address = target
                .parse()
                .context("Target must be given as host:port")?;
            let settings = ClientSettings::from_config(&config, target)?;
            let client = RelayClient::new(settings);

            cancel_on_ctrl_c(client.shutdown_token());
            client.run(config.client.listen_port).await
        }
    }
}
