//! InstantSOUP demo node.
//!
//! Runs a client engine (always) and optionally a server engine on the same
//! host, wiring both event streams to log output. This is the thin
//! presentation stand-in; the protocol lives in the library.

use clap::Parser;
use instantsoup::{ClientConfig, ClientEngine, Event, ServerConfig, ServerEngine};
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "instantsoup", version, about = "InstantSOUP LAN chat node")]
struct Args {
    /// Nickname shown to other peers
    #[arg(short, long, default_value = "Telematik")]
    nick: String,

    /// Also host a server on this machine
    #[arg(short, long)]
    serve: bool,

    /// TCP port for the hosted server (0 = let the OS pick)
    #[arg(short, long, default_value = "49190")]
    tcp_port: u16,

    /// Channel to join on every discovered server
    #[arg(short, long)]
    join: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("instantsoup=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("InstantSOUP v{} — nick {:?}", VERSION, args.nick);

    let server = if args.serve {
        match ServerEngine::spawn(ServerConfig {
            tcp_port: args.tcp_port,
            ..Default::default()
        }) {
            Ok((handle, mut events)) => {
                info!("hosting server {} on port {}", handle.id(), handle.port());
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        info!("server event: {:?}", event);
                    }
                });
                Some(handle)
            }
            Err(e) => {
                error!("cannot start server: {}", e);
                return;
            }
        }
    } else {
        None
    };

    let (client, mut events) = match ClientEngine::spawn(ClientConfig {
        nickname: args.nick,
        ..Default::default()
    }) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("cannot start client: {}", e);
            return;
        }
    };
    info!("client id {}", client.id());

    let auto_join = args.join;
    let client_events = client.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                Event::ServerNew { id, channel: None } => {
                    info!("discovered server {}", id);
                    if let Some(channel) = &auto_join {
                        client_events.join(channel.clone(), id.clone()).await;
                    }
                }
                Event::MessageReceived { channel, line, .. } => {
                    info!("{}: {}", channel, line);
                }
                other => info!("client event: {:?}", other),
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    client.shutdown();
    if let Some(server) = server {
        server.shutdown();
    }
}
