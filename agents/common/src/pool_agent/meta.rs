//! Meta models of the pool agent.
//!
//! Meta records are the persistent control-plane intent the agent holds
//! for its pools, keyed by uuid. Each iteration they are reconciled
//! against the data-plane snapshot the driver reports; observed fields
//! are copied back into the meta record and published as the actual
//! resource.

use crate::driver::{PoolDriver, PoolInfo};
use crate::errors::{InvalidPayload, SvcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use std::{collections::HashMap, sync::Arc};
use store_api::v0::*;
use uuid::Uuid;

fn ratio_one() -> f64 {
    1.0
}

fn active_pool_status() -> MachinePoolStatus {
    MachinePoolStatus::Active
}

/// Machine pool meta model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaPool {
    /// stable identity
    pub uuid: Uuid,
    /// driver selection and configuration
    pub driver_spec: Value,
    /// compute flavour served
    #[serde(default)]
    pub machine_type: NodeType,
    /// cores oversubscription multiplier
    #[serde(default = "ratio_one")]
    pub cores_ratio: f64,
    /// ram oversubscription multiplier
    #[serde(default = "ratio_one")]
    pub ram_ratio: f64,
    /// total cores, oversubscription applied
    #[serde(default)]
    pub all_cores: i64,
    /// total ram, oversubscription applied
    #[serde(default)]
    pub all_ram: i64,
    /// free cores after the observed machines
    #[serde(default)]
    pub avail_cores: i64,
    /// free ram after the observed machines
    #[serde(default)]
    pub avail_ram: i64,
    /// observed state
    #[serde(default = "active_pool_status")]
    pub status: MachinePoolStatus,
    /// observed thin storage pools
    #[serde(default)]
    pub storage_pools: Vec<ThinStoragePool>,
}

impl MetaPool {
    /// Parse the meta pool from a target resource payload
    pub fn from_payload(uuid: Uuid, payload: &Value) -> Result<Self, SvcError> {
        serde_json::from_value(payload.clone()).context(InvalidPayload {
            kind: ResourceKind::Pool.to_string(),
            uuid,
        })
    }

    /// Fold the reported totals in, applying oversubscription exactly
    /// once, and re-derive availability from the observed machines
    pub fn aggregate(&mut self, info: &PoolInfo, machines: &[Machine]) {
        self.all_cores = (info.all_cores as f64 * self.cores_ratio) as i64;
        self.all_ram = (info.all_ram as f64 * self.ram_ratio) as i64;
        self.avail_cores =
            self.all_cores - machines.iter().map(|m| m.cores as i64).sum::<i64>();
        self.avail_ram = self.all_ram - machines.iter().map(|m| m.ram as i64).sum::<i64>();
    }

    /// Whether the pool covers `cores` and `ram` more
    pub fn has_resources(&self, cores: i64, ram: i64) -> bool {
        self.avail_cores >= cores && self.avail_ram >= ram
    }

    /// Debit cores and ram handed out this iteration
    pub fn allocate_resources(&mut self, cores: i64, ram: i64) {
        self.avail_cores -= cores;
        self.avail_ram -= ram;
    }

    /// Whether the first storage pool covers `size` GiB more
    pub fn has_storage(&self, size: u64) -> bool {
        self.storage_pools
            .first()
            .map(|s| s.has_capacity(size))
            .unwrap_or(false)
    }

    /// Debit storage handed out this iteration
    pub fn allocate_storage(&mut self, size: u64) {
        if let Some(storage) = self.storage_pools.first_mut() {
            storage.allocate_capacity(size);
        }
    }

    /// Observation payload published as the pool's actual resource
    pub fn observation(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "driver_spec": self.driver_spec,
            "machine_type": self.machine_type,
            "cores_ratio": self.cores_ratio,
            "ram_ratio": self.ram_ratio,
            "all_cores": self.all_cores,
            "all_ram": self.all_ram,
            "avail_cores": self.avail_cores,
            "avail_ram": self.avail_ram,
            "storage_pools": self.storage_pools,
            "status": self.status,
        })
    }
}

/// Volume meta model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaVolume {
    /// stable identity
    pub uuid: Uuid,
    /// name on the hypervisor
    #[serde(default)]
    pub name: String,
    /// owning pool
    pub pool: Option<Uuid>,
    /// slot of the volume
    #[serde(default)]
    pub index: u32,
    /// size in GiB
    pub size: u64,
    /// base image
    #[serde(default)]
    pub image: Option<String>,
    /// desired attachment
    #[serde(default)]
    pub machine: Option<Uuid>,
    /// whether the firmware may boot from it
    #[serde(default)]
    pub boot: bool,
    /// filesystem label
    #[serde(default)]
    pub label: Option<String>,
    /// device flavour
    #[serde(default)]
    pub device_type: VolumeType,
    /// owning tenant
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// observed state
    #[serde(default)]
    pub status: VolumeStatus,
}

impl MetaVolume {
    /// Parse the meta volume from a target resource payload
    pub fn from_payload(uuid: Uuid, payload: &Value) -> Result<Self, SvcError> {
        serde_json::from_value(payload.clone()).context(InvalidPayload {
            kind: ResourceKind::PoolVolume.to_string(),
            uuid,
        })
    }

    /// Root volumes are attached by the driver during machine creation,
    /// never by the meta plane
    pub fn is_root(&self) -> bool {
        self.machine.is_some() && self.index == ROOT_VOLUME_INDEX
    }

    /// Copy the observed fields back into the meta record
    pub fn restore_from(&mut self, dp_volume: &MachineVolume) {
        self.name = dp_volume.name.clone();
        self.size = dp_volume.size;
        self.status = dp_volume.status;
    }

    /// Data-plane form of the meta record
    pub fn to_dp_volume(&self) -> MachineVolume {
        let mut volume = MachineVolume::default();
        volume.uuid = self.uuid;
        volume.name = self.name.clone();
        volume.image = self.image.clone();
        volume.size = self.size;
        volume.boot = self.boot;
        volume.label = self.label.clone();
        volume.device_type = self.device_type;
        volume.index = self.index;
        volume.machine = self.machine;
        volume.pool = self.pool;
        volume.project_id = self.project_id.unwrap_or_else(Uuid::nil);
        volume
    }

    /// Observation payload published as the volume's actual resource
    pub fn observation(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "name": self.name,
            "pool": self.pool,
            "index": self.index,
            "size": self.size,
            "image": self.image,
            "machine": self.machine,
            "boot": self.boot,
            "label": self.label,
            "device_type": self.device_type,
            "project_id": self.project_id,
            "status": self.status,
        })
    }
}

/// Machine meta model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaMachine {
    /// stable identity
    pub uuid: Uuid,
    /// name on the hypervisor
    #[serde(default)]
    pub name: String,
    /// allocated cores
    #[serde(default)]
    pub cores: u32,
    /// allocated ram, MiB
    #[serde(default)]
    pub ram: u64,
    /// compute flavour
    #[serde(default)]
    pub machine_type: NodeType,
    /// node backed by the machine
    #[serde(default)]
    pub node: Option<Uuid>,
    /// owning pool
    pub pool: Option<Uuid>,
    /// boot source
    #[serde(default)]
    pub boot: BootAlternative,
    /// image on the root disk
    #[serde(default)]
    pub image: Option<String>,
    /// primary port summary
    #[serde(default)]
    pub port_info: PortInfo,
    /// owning tenant
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// observed state
    #[serde(default)]
    pub status: MachineStatus,
}

impl MetaMachine {
    /// Parse the meta machine from a target resource payload
    pub fn from_payload(uuid: Uuid, payload: &Value) -> Result<Self, SvcError> {
        serde_json::from_value(payload.clone()).context(InvalidPayload {
            kind: ResourceKind::PoolMachine.to_string(),
            uuid,
        })
    }

    /// Copy the observed fields back into the meta record. Legacy
    /// machines report no image; keep the meta one so they are not
    /// needlessly recreated.
    pub fn restore_from(&mut self, dp_machine: &Machine) {
        self.cores = dp_machine.cores;
        self.ram = dp_machine.ram;
        self.status = dp_machine.status;
        self.image = dp_machine.image.clone().or_else(|| self.image.clone());
    }

    /// Data-plane form of the meta record
    pub fn to_dp_machine(&self) -> Machine {
        let mut machine = Machine::default();
        machine.uuid = self.uuid;
        machine.name = self.name.clone();
        machine.cores = self.cores;
        machine.ram = self.ram;
        machine.machine_type = self.machine_type;
        machine.node = self.node;
        machine.pool = self.pool;
        machine.boot = self.boot;
        machine.image = self.image.clone();
        machine.project_id = self.project_id.unwrap_or_else(Uuid::nil);
        machine
    }

    /// Port derived from the single-port flat network contract
    pub fn to_port(&self) -> Port {
        let mut port = Port::default();
        port.uuid = self.port_info.uuid;
        port.subnet = self.port_info.subnet;
        port.ipv4 = self.port_info.ipv4;
        port.mask = self.port_info.mask;
        port.mac = self.port_info.mac.clone();
        port.machine = Some(self.uuid);
        port.node = self.node;
        port.status = PortStatus::Active;
        port.project_id = self.project_id.unwrap_or_else(Uuid::nil);
        port
    }

    /// Observation payload published as the machine's actual resource
    pub fn observation(&self) -> Value {
        serde_json::json!({
            "uuid": self.uuid,
            "name": self.name,
            "cores": self.cores,
            "ram": self.ram,
            "machine_type": self.machine_type,
            "node": self.node,
            "pool": self.pool,
            "boot": self.boot,
            "image": self.image,
            "port_info": self.port_info,
            "project_id": self.project_id,
            "status": self.status,
        })
    }
}

/// Runtime state of one pool within an agent iteration: the parsed meta
/// record, the loaded driver and the indexed data-plane snapshot
pub struct PoolState {
    /// the meta record
    pub meta: MetaPool,
    /// driver instance for the pool
    pub driver: Arc<dyn PoolDriver>,
    /// observed machines by uuid
    pub dp_machines: HashMap<Uuid, Machine>,
    /// observed volumes by uuid
    pub dp_volumes: HashMap<Uuid, MachineVolume>,
}
