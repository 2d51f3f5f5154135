use clap::Parser;
use lifelink_relay::{AppState, serve};
use tracing::{error, info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "lifelink-relay")]
struct RelayArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,

    /// Base URL clients use to fetch uploaded objects.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    public_url: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = RelayArgs::parse();
    let public_url = match Url::parse(&args.public_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        Ok(url) => {
            error!("public url must be http or https, got {}", url.scheme());
            std::process::exit(2);
        }
        Err(err) => {
            error!("invalid public url {}: {}", args.public_url, err);
            std::process::exit(2);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!(public_url = %public_url, "relay starting on {}", args.bind_address);
    if let Err(err) = serve(listener, AppState::new(public_url)).await {
        warn!("relay server exited: {}", err);
    }
}
