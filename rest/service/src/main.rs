//! Orchestration api service: serves the netboot scripts and the
//! core-agent payload protocol over the shared store.

use actix_web::{App, HttpServer};
use common::boot::NetbootConfig;
use store_api::Store;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "rest", about = "Orchestration api of the control plane")]
struct CliArgs {
    /// Address to listen on
    #[structopt(long, short, default_value = "0.0.0.0:11011")]
    bind: String,
    /// Host the booting machines reach the control plane on
    #[structopt(long, default_value = "localhost", env = "GC_HOST")]
    gc_host: String,
    /// Port the booting machines reach the control plane on
    #[structopt(long, default_value = "11011", env = "GC_PORT")]
    gc_port: u16,
    /// Kernel url override for netboot
    #[structopt(long)]
    kernel: Option<String>,
    /// Initrd url override for netboot
    #[structopt(long)]
    initrd: Option<String>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let args = CliArgs::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let store = Store::new();
    let config = NetbootConfig {
        gc_host: args.gc_host.clone(),
        gc_port: args.gc_port,
        kernel: args.kernel.clone(),
        initrd: args.initrd.clone(),
    };

    tracing::info!("Serving the orchestration api on {}", args.bind);
    HttpServer::new(move || {
        App::new()
            .data(store.clone())
            .data(config.clone())
            .configure(rest_api::v0::configure)
    })
    .bind(args.bind.clone())?
    .run()
    .await
}
