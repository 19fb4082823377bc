//! Applies a YAML startup manifest to a store and reports what landed.
//! Running it twice is safe; records are matched by uuid.

use common::manifest;
use std::path::PathBuf;
use store_api::Store;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "bootstrap", about = "Apply a startup manifest")]
struct CliArgs {
    /// The startup manifest to apply
    #[structopt(long, short, env = "GC_STARTUP_MANIFEST")]
    manifest: PathBuf,
    /// Only validate the manifest, do not apply it
    #[structopt(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let startup = match manifest::load(&args.manifest) {
        Ok(startup) => startup,
        Err(error) => {
            tracing::error!("{}", error);
            std::process::exit(1);
        }
    };

    if args.check {
        tracing::info!("Manifest {} is valid", args.manifest.display());
        return;
    }

    let store = Store::new();
    if let Err(error) = manifest::apply(&store, &startup).await {
        tracing::error!("Failed to apply manifest: {}", error);
        std::process::exit(1);
    }
}
