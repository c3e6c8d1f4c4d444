use std::path::PathBuf;

use augur_gateway::{
    config::{GatewayConfig, LogFormat},
    server,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Cached, batchable HTTP endpoints over metric functions")]
struct Args {
    /// YAML config file; `AUGUR_*` environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = GatewayConfig::load(args.config.as_deref())?;
    init_tracing(cfg.log_format);

    tracing::info!(
        config = ?args.config,
        host = %cfg.host,
        port = cfg.port,
        cache_expire = cfg.cache_expire,
        "starting"
    );

    // The stock binary has no metric sources of its own: it serves the status and batch routes.
    // Applications embed the library and pass their sources to `server::serve`; see
    // `demos/github_stub.rs` for a runnable one.
    server::serve(&cfg, &[]).await
}
