use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use rtmp_redirect_proxy::config::RewriteConfig;
use rtmp_redirect_proxy::connection;

#[derive(Parser, Debug)]
#[command(name = "rtmp-redirect-proxy", about = "RTMP publish-redirecting proxy")]
struct Args {
    /// rtmp://host[:port]/app[?query] the publisher believes it is publishing to;
    /// its host/app/query become the upstream address and rewrite targets.
    #[arg(short = 'p', long = "publish-url")]
    publish_url: String,

    /// TCP address to listen on for inbound publishers.
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:1935")]
    listen: String,

    /// Raise the log level (repeatable: -v for debug, -vv for trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let cfg = match RewriteConfig::from_publish_url(&args.publish_url) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!(error = %e, "invalid publish url");
            std::process::exit(1);
        }
    };
    tracing::info!(
        upstream = %cfg.upstream_addr,
        app = %cfg.app_name,
        play_url = %cfg.play_url,
        stream_name = %cfg.stream_name,
        "rewrite configuration"
    );

    let listener = match TcpListener::bind(&args.listen).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %args.listen, "failed to bind listener");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %args.listen, "listening for publishers");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        tokio::spawn(connection::handle_connection(stream, peer_addr, cfg.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                break;
            }
        }
    }
}
