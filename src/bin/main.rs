use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use caddytail::adapters::{MaybeUser, identity_layer};
use caddytail::{CaddyTail, ProxyConfig, UserRecord, generate};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "caddytail")]
#[command(about = "Tailscale identity bridge for local web apps")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ProxyArgs {
    /// Load the proxy configuration from a JSON file instead of flags
    #[arg(long, env = "CADDYTAIL_CONFIG", conflicts_with_all = ["hostname", "tailnet"])]
    config: Option<PathBuf>,
    /// Tailscale hostname (without the tailnet suffix)
    #[arg(long, env = "CADDYTAIL_HOSTNAME", required_unless_present = "config")]
    hostname: Option<String>,
    /// Tailnet name (without .ts.net)
    #[arg(long, env = "CADDYTAIL_TAILNET", required_unless_present = "config")]
    tailnet: Option<String>,
    /// Local port the application listens on
    #[arg(short, long, default_value = "10800")]
    port: u16,
    /// Serve this directory at /static/*
    #[arg(long)]
    static_dir: Option<PathBuf>,
    /// Enable Caddy debug logging
    #[arg(long, default_value_t = false)]
    debug: bool,
}

impl ProxyArgs {
    fn into_config(self) -> Result<ProxyConfig> {
        if let Some(path) = self.config {
            return ProxyConfig::from_json_file(path);
        }

        // clap enforces presence when no config file is given.
        let (Some(hostname), Some(tailnet)) = (self.hostname, self.tailnet) else {
            anyhow::bail!("--hostname and --tailnet are required without --config");
        };

        let mut config = ProxyConfig::new(hostname, tailnet, self.port);
        if let Some(dir) = self.static_dir {
            config = config.with_static_path("/static/*", dir);
        }
        if self.debug {
            config = config.with_debug();
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo application behind the supervised proxy
    Run {
        #[command(flatten)]
        proxy: ProxyArgs,
    },
    /// Print the generated Caddyfile and exit
    Render {
        #[command(flatten)]
        proxy: ProxyArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("caddytail=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { proxy } => {
            let config = proxy.into_config()?;
            let port = config.app_port;
            info!(
                "Serving demo app for {} on local port {}",
                config.site_address(),
                port
            );

            let bridge = CaddyTail::new(config)?;
            let app = demo_router(&bridge);

            let listener =
                tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
            info!("Application listening on http://127.0.0.1:{}", port);

            bridge
                .run_blocking(async move {
                    axum::serve(listener, app).await?;
                    Ok(())
                })
                .await?;
        }
        Commands::Render { proxy } => {
            let document = generate(&proxy.into_config()?)?;
            print!("{}", document);
        }
    }

    Ok(())
}

/// Routes mirroring the classic integration example: a greeting page, a
/// JSON identity endpoint, and a route that requires a user.
fn demo_router(bridge: &CaddyTail) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/me", get(api_me))
        .route("/protected", get(protected))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(identity_layer(bridge.extractor().clone())),
        )
}

async fn index(MaybeUser(user): MaybeUser) -> (StatusCode, String) {
    match user {
        Some(user) => (
            StatusCode::OK,
            format!("Hello, {}! Your login is {}.\n", user.name, user.login),
        ),
        None => (StatusCode::UNAUTHORIZED, "Not authenticated\n".to_string()),
    }
}

async fn api_me(user: UserRecord) -> Json<UserRecord> {
    Json(user)
}

async fn protected(user: UserRecord) -> String {
    format!("Hello, {}! This is a protected route.\n", user.name)
}
