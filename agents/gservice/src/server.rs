//! Runs every in-process reconciliation service against one store: the
//! scheduler, the builders, the machine build coordinator and the pool
//! agent.

use common::{
    builders::{
        LbBuilder, MachineBuilderService, NodeBuilder, NodeSetBuilder, PoolBuilder, VolumeBuilder,
    },
    driver, manifest,
    pool_agent::PoolAgentService,
    reconciler::Reconciler,
    scheduler::SchedulerService,
    work_dir, Service,
};
use std::path::PathBuf;
use store_api::Store;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "gservice", about = "Compute control plane services")]
struct CliArgs {
    /// Period between two service iterations
    #[structopt(long, short, default_value = "1sec")]
    period: humantime::Duration,
    /// Work directory holding the node identity and agent metadata
    #[structopt(long, short, default_value = "/var/lib/genesis", env = "GC_WORK_DIR")]
    work_dir: PathBuf,
    /// Startup manifest applied before the services start
    #[structopt(long, short)]
    startup: Option<PathBuf>,
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

    if let Err(error) = run(args).await {
        tracing::error!("gservice failed: {}", error);
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<(), common::SvcError> {
    driver::register_default_drivers();

    let node_uuid = work_dir::node_uuid(&args.work_dir)?;
    tracing::info!("Starting services on node {}", node_uuid);

    let store = Store::new();
    if let Some(path) = &args.startup {
        let startup = manifest::load(path)?;
        manifest::apply(&store, &startup).await?;
    }

    let pool_builder_uuid = work_dir::service_uuid(&node_uuid, "pool_builder");
    let machine_builder_uuid = work_dir::service_uuid(&node_uuid, "builder");
    let agent_uuid = work_dir::service_uuid(&node_uuid, "machine_pool_agent");
    let meta_file = work_dir::pool_agent_meta_file(&args.work_dir);

    Service::builder()
        .with_period(args.period.into())
        .with_service(SchedulerService::with_defaults(store.clone()))
        .with_service(Reconciler::new(PoolBuilder::new(pool_builder_uuid), store.clone()))
        .with_service(Reconciler::new(NodeBuilder::new(), store.clone()))
        .with_service(Reconciler::new(VolumeBuilder::new(), store.clone()))
        .with_service(Reconciler::new(NodeSetBuilder::new(), store.clone()))
        .with_service(Reconciler::new(LbBuilder::new(), store.clone()))
        .with_service(MachineBuilderService::new(machine_builder_uuid, store.clone()))
        .with_service(PoolAgentService::new(
            agent_uuid,
            store.clone(),
            Some(meta_file),
        ))
        .run()
        .await;
    Ok(())
}
