//! Startup manifest: declarative YAML applied to the store before the
//! services start. Application is idempotent; records are matched by
//! uuid, existing ones are updated rather than duplicated.

use crate::errors::{SvcError, WorkDir};
use serde::Deserialize;
use snafu::ResultExt;
use std::{net::Ipv4Addr, path::Path};
use store_api::{v0::*, Store};
use uuid::Uuid;

/// The startup manifest
#[derive(Debug, Default, Deserialize)]
pub struct StartupManifest {
    /// machine pools to register
    #[serde(default)]
    pub pools: Vec<PoolEntry>,
    /// ports pre-allocated by the network layer
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    /// initial nodes
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    /// initial node sets
    #[serde(default)]
    pub node_sets: Vec<NodeSetEntry>,
    /// initial load balancers
    #[serde(default)]
    pub load_balancers: Vec<LbEntry>,
}

/// One machine pool
#[derive(Debug, Deserialize)]
pub struct PoolEntry {
    /// stable identity
    pub uuid: Uuid,
    /// display name
    #[serde(default)]
    pub name: String,
    /// driver selection and configuration
    pub driver_spec: serde_json::Value,
    /// compute flavour served
    #[serde(default)]
    pub machine_type: NodeType,
    /// cores oversubscription multiplier
    #[serde(default = "ratio_one")]
    pub cores_ratio: f64,
    /// ram oversubscription multiplier
    #[serde(default = "ratio_one")]
    pub ram_ratio: f64,
}

fn ratio_one() -> f64 {
    1.0
}

/// One pre-allocated port
#[derive(Debug, Deserialize)]
pub struct PortEntry {
    /// stable identity
    pub uuid: Uuid,
    /// node the port belongs to
    pub node: Option<Uuid>,
    /// allocated address
    pub ipv4: Option<Ipv4Addr>,
    /// network mask
    pub mask: Option<Ipv4Addr>,
    /// hardware address, generated when absent
    pub mac: Option<String>,
}

/// One node of intent
#[derive(Debug, Deserialize)]
pub struct NodeEntry {
    /// stable identity
    pub uuid: Uuid,
    /// display name
    #[serde(default)]
    pub name: String,
    /// owning tenant
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// requested cores
    pub cores: u32,
    /// requested ram, MiB
    pub ram: u64,
    /// image consumed by provisioning
    pub image: String,
    /// root disk size, GiB
    #[serde(default)]
    pub root_disk_size: Option<u64>,
    /// compute flavour
    #[serde(default)]
    pub node_type: NodeType,
}

/// One node set of intent
#[derive(Debug, Deserialize)]
pub struct NodeSetEntry {
    /// stable identity
    pub uuid: Uuid,
    /// display name
    #[serde(default)]
    pub name: String,
    /// owning tenant
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// replica count
    pub replicas: u32,
    /// cores per node
    pub cores: u32,
    /// ram per node, MiB
    pub ram: u64,
    /// image per node
    pub image: String,
    /// root disk size per node, GiB
    #[serde(default)]
    pub root_disk_size: Option<u64>,
}

/// One load balancer of intent
#[derive(Debug, Deserialize)]
pub struct LbEntry {
    /// stable identity
    pub uuid: Uuid,
    /// display name
    #[serde(default)]
    pub name: String,
    /// owning tenant
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// shape of the group
    pub lb_type: LbType,
    /// image the members run
    pub image: String,
}

/// Parse a manifest file
pub fn load(path: &Path) -> Result<StartupManifest, SvcError> {
    let raw = std::fs::read_to_string(path).context(WorkDir {
        details: format!("reading {}", path.display()),
    })?;
    serde_yaml::from_str(&raw).map_err(|error| SvcError::Internal {
        details: format!("invalid manifest {}: {}", path.display(), error),
    })
}

/// Apply a manifest to the store
pub async fn apply(store: &Store, manifest: &StartupManifest) -> Result<(), SvcError> {
    for entry in &manifest.pools {
        let mut pool = store.find_pool(&entry.uuid).await.unwrap_or_default();
        pool.uuid = entry.uuid;
        pool.name = entry.name.clone();
        pool.driver_spec = entry.driver_spec.clone();
        pool.machine_type = entry.machine_type;
        pool.cores_ratio = entry.cores_ratio;
        pool.ram_ratio = entry.ram_ratio;
        pool.status = MachinePoolStatus::Active;
        store.save_pool(pool).await?;
    }

    for entry in &manifest.ports {
        let mut port = store.find_port(&entry.uuid).await.unwrap_or_default();
        port.uuid = entry.uuid;
        port.node = entry.node;
        port.ipv4 = entry.ipv4;
        port.mask = entry.mask;
        port.mac = Some(
            entry
                .mac
                .clone()
                .unwrap_or_else(|| Port::generate_mac(true)),
        );
        port.status = PortStatus::Active;
        store.save_port(port).await?;
    }

    for entry in &manifest.nodes {
        let mut node = store.find_node(&entry.uuid).await.unwrap_or_default();
        node.uuid = entry.uuid;
        node.name = entry.name.clone();
        node.project_id = entry.project_id.unwrap_or_else(Uuid::nil);
        node.cores = entry.cores;
        node.ram = entry.ram;
        node.image = entry.image.clone();
        node.root_disk_size = entry.root_disk_size.unwrap_or(DEF_ROOT_DISK_SIZE);
        node.node_type = entry.node_type;
        node.disk_spec = DiskSpec::root(node.root_disk_size, Some(node.image.clone()));
        store.save_node(node).await?;
    }

    for entry in &manifest.node_sets {
        let mut set = store.find_node_set(&entry.uuid).await.unwrap_or_default();
        set.uuid = entry.uuid;
        set.name = entry.name.clone();
        set.project_id = entry.project_id.unwrap_or_else(Uuid::nil);
        set.replicas = entry.replicas;
        set.cores = entry.cores;
        set.ram = entry.ram;
        set.image = entry.image.clone();
        set.root_disk_size = entry.root_disk_size.unwrap_or(DEF_ROOT_DISK_SIZE);
        store.save_node_set(set).await?;
    }

    for entry in &manifest.load_balancers {
        let mut lb = store
            .find_load_balancer(&entry.uuid)
            .await
            .unwrap_or_default();
        lb.uuid = entry.uuid;
        lb.name = entry.name.clone();
        lb.project_id = entry.project_id.unwrap_or_else(Uuid::nil);
        lb.lb_type = entry.lb_type.clone();
        lb.image = entry.image.clone();
        store.save_load_balancer(lb).await?;
    }

    tracing::info!(
        "Applied startup manifest: {} pools, {} ports, {} nodes, {} sets, {} lbs",
        manifest.pools.len(),
        manifest.ports.len(),
        manifest.nodes.len(),
        manifest.node_sets.len(),
        manifest.load_balancers.len()
    );
    Ok(())
}
