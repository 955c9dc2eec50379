use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use logos_replica::{AllowAnonymous, Authenticator, ServerConfig, StaticTokens, SyncServer};

/// Document sync relay.
#[derive(Debug, Parser)]
#[command(version, about = "WebSocket relay for replicated documents", long_about = None)]
struct Cli {
    /// Address to listen on
    #[clap(long, value_name = "ADDR", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; documents are kept in memory when omitted
    #[clap(long, value_name = "DIR")]
    storage: Option<PathBuf>,

    /// Commits per backlog page
    #[clap(long, default_value_t = 500)]
    page_size: usize,

    /// Broadcast queue length per document
    #[clap(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Reject commits whose ref does not match their content
    #[clap(long)]
    verify_refs: bool,

    /// Accept only these bearer tokens, given as TOKEN=USER
    #[clap(long = "token", value_name = "TOKEN=USER")]
    tokens: Vec<String>,
}

fn authenticator(tokens: &[String]) -> Result<Arc<dyn Authenticator>, String> {
    if tokens.is_empty() {
        return Ok(Arc::new(AllowAnonymous));
    }
    let mut static_tokens = StaticTokens::new();
    for entry in tokens {
        let (token, user) = entry
            .split_once('=')
            .filter(|(token, user)| !token.is_empty() && !user.is_empty())
            .ok_or_else(|| format!("invalid --token {entry:?}, expected TOKEN=USER"))?;
        static_tokens = static_tokens.with_token(token, user);
    }
    Ok(Arc::new(static_tokens))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let authenticator = match authenticator(&cli.tokens) {
        Ok(authenticator) => authenticator,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(2);
        }
    };
    let config = ServerConfig {
        bind_addr: cli.bind,
        broadcast_capacity: cli.broadcast_capacity,
        page_size: cli.page_size,
        verify_refs: cli.verify_refs,
        storage_path: cli.storage,
        ..ServerConfig::default()
    };

    let server = match SyncServer::new(config) {
        Ok(server) => Arc::new(server.with_authenticator(authenticator)),
        Err(e) => {
            log::error!("failed to open storage: {e}");
            std::process::exit(1);
        }
    };

    let running = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };
    tokio::select! {
        result = running => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("relay failed: {e}");
                std::process::exit(1);
            }
            Err(e) => {
                log::error!("relay task panicked: {e}");
                std::process::exit(1);
            }
        },
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            server.shutdown();
        }
    }
}
