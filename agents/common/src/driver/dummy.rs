//! Inert pool backend used by tests and as a placeholder for pools that
//! are registered but not yet wired to a hypervisor.

use super::{DriverError, PoolDriver, PoolInfo, PoolSnapshot};
use crate::SvcError;
use async_trait::async_trait;
use std::sync::Arc;
use store_api::v0::{Machine, MachinePool, MachineVolume, Port, ThinStoragePool};
use uuid::Uuid;

/// Driver with empty implementations; every operation succeeds and
/// reports nothing
#[derive(Debug, Default, Clone)]
pub struct DummyPoolDriver {}

impl DummyPoolDriver {
    /// Constructor registered under the `dummy` name
    pub fn factory(_pool: &MachinePool) -> Result<Arc<dyn PoolDriver>, SvcError> {
        Ok(Arc::new(Self::default()))
    }
}

#[async_trait]
impl PoolDriver for DummyPoolDriver {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn get_pool_info(&self) -> Result<PoolInfo, DriverError> {
        Ok(PoolInfo::default())
    }

    async fn list_pool_resources(&self) -> Result<PoolSnapshot, DriverError> {
        Ok(PoolSnapshot::default())
    }

    async fn create_machine(
        &self,
        machine: &Machine,
        _volumes: &[MachineVolume],
        _ports: &[Port],
    ) -> Result<Machine, DriverError> {
        Ok(machine.clone())
    }

    async fn delete_machine(
        &self,
        _machine: &Machine,
        _delete_volumes: bool,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn get_machine(&self, machine: &Uuid) -> Result<Machine, DriverError> {
        let mut dummy = Machine::default();
        dummy.uuid = *machine;
        dummy.name = "dummy-machine".into();
        Ok(dummy)
    }

    async fn create_volume(&self, volume: &MachineVolume) -> Result<MachineVolume, DriverError> {
        Ok(volume.clone())
    }

    async fn delete_volume(&self, _volume: &MachineVolume) -> Result<(), DriverError> {
        Ok(())
    }

    async fn resize_volume(&self, _volume: &MachineVolume) -> Result<(), DriverError> {
        Ok(())
    }

    async fn attach_volume(&self, _volume: &MachineVolume) -> Result<(), DriverError> {
        Ok(())
    }

    async fn detach_volume(&self, _volume: &MachineVolume) -> Result<(), DriverError> {
        Ok(())
    }

    async fn get_volume(&self, volume: &Uuid) -> Result<MachineVolume, DriverError> {
        let mut dummy = MachineVolume::default();
        dummy.uuid = *volume;
        Ok(dummy)
    }

    async fn set_machine_cores(&self, _machine: &Machine, _cores: u32) -> Result<(), DriverError> {
        Ok(())
    }

    async fn set_machine_ram(&self, _machine: &Machine, _ram: u64) -> Result<(), DriverError> {
        Ok(())
    }

    async fn rename_machine(&self, _machine: &Machine, _name: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn recreate_machine(&self, _machine: &Machine) -> Result<(), DriverError> {
        Ok(())
    }

    async fn reset_machine(&self, _machine: &Machine) -> Result<(), DriverError> {
        Ok(())
    }

    async fn shutdown_machine(&self, _machine: &Machine, _force: bool) -> Result<(), DriverError> {
        Ok(())
    }

    async fn start_machine(&self, _machine: &Machine) -> Result<(), DriverError> {
        Ok(())
    }

    async fn list_storage_pools(&self) -> Result<Vec<ThinStoragePool>, DriverError> {
        Ok(vec![])
    }
}
