use clap::Parser;
use sniproxy_bin::{resolve_metrics_addr, run};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "/etc/sniproxy/config.json")]
    config: PathBuf,

    /// Address the Prometheus `/metrics` + `/health` HTTP server listens on.
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Disable the metrics/health HTTP server entirely.
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let metrics_addr = resolve_metrics_addr(args.metrics_addr, args.no_metrics)?;
    run(&args.config, metrics_addr).await
}
