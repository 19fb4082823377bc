//! Hypervisor driver contract.
//!
//! A pool backend is selected per pool from `driver_spec.driver` and
//! instantiated once per canonical spec. All operations are idempotent
//! from the caller's point of view: "already in the target state" is
//! reported through a dedicated failure kind and treated as success.

use crate::errors::{DriverNotFound, InvalidDriverSpec, SvcError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use snafu::{OptionExt, Snafu};
use std::{collections::HashMap, sync::Arc, sync::Mutex, time::Duration};
use store_api::v0::{Machine, MachinePool, MachineVolume, Port, ThinStoragePool};
use uuid::Uuid;

mod dummy;
mod mem;

pub use dummy::DummyPoolDriver;
pub use mem::MemPoolDriver;

/// Per-call deadline for driver operations. A timed out call is logged
/// and retried on the next iteration; idempotence is the recovery
/// mechanism for anything the hypervisor committed in the meantime.
pub const DRIVER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure kinds a driver may report
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
#[allow(missing_docs)]
pub enum DriverError {
    #[snafu(display("Machine '{}' already exists", machine))]
    MachineAlreadyExists { machine: Uuid },
    #[snafu(display("Machine '{}' not found", machine))]
    MachineNotFound { machine: Uuid },
    #[snafu(display("Volume '{}' already exists", volume))]
    VolumeAlreadyExists { volume: Uuid },
    #[snafu(display("Volume '{}' not found", volume))]
    VolumeNotFound { volume: Uuid },
    #[snafu(display("Volume '{}' is already attached", volume))]
    VolumeAlreadyAttached { volume: Uuid },
    #[snafu(display("Volume '{}' is not attached", volume))]
    VolumeNotAttached { volume: Uuid },
    #[snafu(display("Root volume not found for machine '{}'", machine))]
    RootVolumeNotFound { machine: Uuid },
    #[snafu(display("Refusing to shrink volume '{}' from {} to {} GiB", volume, from, to))]
    ShrinkForbidden { volume: Uuid, from: u64, to: u64 },
    #[snafu(display("Driver request '{}' timed out after {:?}", request, timeout))]
    Timeout {
        request: &'static str,
        timeout: Duration,
    },
    #[snafu(display("Driver request '{}' failed: {}", request, details))]
    Request {
        request: &'static str,
        details: String,
    },
}

impl DriverError {
    /// Whether the failure means the data plane is already in the state
    /// the caller asked for
    pub fn already_in_target_state(&self) -> bool {
        matches!(
            self,
            Self::MachineAlreadyExists { .. }
                | Self::VolumeAlreadyExists { .. }
                | Self::VolumeAlreadyAttached { .. }
                | Self::VolumeNotAttached { .. }
        )
    }
}

/// Capacity totals reported by a pool backend, before oversubscription
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolInfo {
    /// physical cores of the hypervisor
    pub all_cores: i64,
    /// physical ram of the hypervisor, MiB
    pub all_ram: i64,
}

/// Atomic snapshot of everything a pool backend holds, used to rebuild
/// the meta-plane's view each iteration
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    /// capacity totals
    pub info: PoolInfo,
    /// thin storage pools
    pub storage_pools: Vec<ThinStoragePool>,
    /// guests known to the hypervisor
    pub machines: Vec<Machine>,
    /// volumes known to the hypervisor
    pub volumes: Vec<MachineVolume>,
}

/// Operations any pool backend must provide
#[async_trait]
pub trait PoolDriver: Send + Sync {
    /// The concrete driver behind the trait object
    fn as_any(&self) -> &dyn std::any::Any;

    /// Capacity totals. Must not block on the hypervisor's workload.
    async fn get_pool_info(&self) -> Result<PoolInfo, DriverError>;

    /// Atomic snapshot of the pool's resources
    async fn list_pool_resources(&self) -> Result<PoolSnapshot, DriverError>;

    /// Create a machine with its volumes and ports. Idempotent by
    /// `machine.uuid`: an existing domain is reported as present rather
    /// than re-created. The root volume must come first by index.
    async fn create_machine(
        &self,
        machine: &Machine,
        volumes: &[MachineVolume],
        ports: &[Port],
    ) -> Result<Machine, DriverError>;

    /// Delete the machine, succeeding even when the domain is not
    /// running. Volume deletion is best effort per volume.
    async fn delete_machine(&self, machine: &Machine, delete_volumes: bool)
        -> Result<(), DriverError>;

    /// Get one machine by uuid
    async fn get_machine(&self, machine: &Uuid) -> Result<Machine, DriverError>;

    /// Create a volume
    async fn create_volume(&self, volume: &MachineVolume) -> Result<MachineVolume, DriverError>;

    /// Delete a volume
    async fn delete_volume(&self, volume: &MachineVolume) -> Result<(), DriverError>;

    /// Grow a volume to `volume.size`. Shrinking is refused.
    async fn resize_volume(&self, volume: &MachineVolume) -> Result<(), DriverError>;

    /// Attach the volume to `volume.machine`
    async fn attach_volume(&self, volume: &MachineVolume) -> Result<(), DriverError>;

    /// Detach the volume from its machine
    async fn detach_volume(&self, volume: &MachineVolume) -> Result<(), DriverError>;

    /// Get one volume by uuid
    async fn get_volume(&self, volume: &Uuid) -> Result<MachineVolume, DriverError>;

    /// Set the core count. May be implemented as delete-and-recreate
    /// preserving the uuid, ports and non-root volumes.
    async fn set_machine_cores(&self, machine: &Machine, cores: u32) -> Result<(), DriverError>;

    /// Set the ram size, same latitude as `set_machine_cores`
    async fn set_machine_ram(&self, machine: &Machine, ram: u64) -> Result<(), DriverError>;

    /// Rename the machine
    async fn rename_machine(&self, machine: &Machine, name: &str) -> Result<(), DriverError>;

    /// Recreate the machine in place, preserving uuid, ports and
    /// non-root volumes. Used when the image changes.
    async fn recreate_machine(&self, machine: &Machine) -> Result<(), DriverError>;

    /// Reset the machine, best effort; a stopped domain is not an error
    async fn reset_machine(&self, machine: &Machine) -> Result<(), DriverError>;

    /// Shut the machine down, best effort
    async fn shutdown_machine(&self, machine: &Machine, force: bool) -> Result<(), DriverError>;

    /// Start the machine, best effort
    async fn start_machine(&self, machine: &Machine) -> Result<(), DriverError>;

    /// Thin storage pools with reported and free capacity
    async fn list_storage_pools(&self) -> Result<Vec<ThinStoragePool>, DriverError>;
}

/// Constructor registered for one driver name
pub type DriverFactory = fn(&MachinePool) -> Result<Arc<dyn PoolDriver>, SvcError>;

static REGISTRY: Lazy<Mutex<HashMap<String, DriverFactory>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static INSTANCES: Lazy<Mutex<HashMap<String, Arc<dyn PoolDriver>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register a driver constructor under `name`
pub fn register_driver(name: &str, factory: DriverFactory) {
    REGISTRY
        .lock()
        .expect("driver registry poisoned")
        .insert(name.to_string(), factory);
}

/// Register the drivers that ship in-tree
pub fn register_default_drivers() {
    register_driver("dummy", DummyPoolDriver::factory);
    register_driver("mem", MemPoolDriver::factory);
}

/// Load the driver for a pool, cached by the canonical string form of
/// its spec so every service in the process shares one instance
pub fn load_driver(pool: &MachinePool) -> Result<Arc<dyn PoolDriver>, SvcError> {
    let key = pool.driver_spec.to_string();
    if let Some(driver) = INSTANCES
        .lock()
        .expect("driver instances poisoned")
        .get(&key)
    {
        return Ok(driver.clone());
    }

    let name = pool
        .driver_name()
        .map(str::to_string)
        .context(InvalidDriverSpec { pool: pool.uuid })?;
    let factory = *REGISTRY
        .lock()
        .expect("driver registry poisoned")
        .get(&name)
        .context(DriverNotFound { name })?;
    let driver = factory(pool)?;
    INSTANCES
        .lock()
        .expect("driver instances poisoned")
        .insert(key, driver.clone());
    Ok(driver)
}

/// Guard a driver call with the per-call deadline
pub async fn with_timeout<T, F>(request: &'static str, call: F) -> Result<T, DriverError>
where
    F: std::future::Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(DRIVER_CALL_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout {
            request,
            timeout: DRIVER_CALL_TIMEOUT,
        }),
    }
}
