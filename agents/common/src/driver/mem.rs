//! In-memory pool backend.
//!
//! Emulates one hypervisor's bookkeeping faithfully enough to exercise
//! the meta plane end to end: creates are idempotent by uuid, attach and
//! detach report "already in target state" through the dedicated failure
//! kinds, and resize refuses shrinking. Used by the integration tests
//! and for local development without a hypervisor.

use super::{DriverError, PoolDriver, PoolInfo, PoolSnapshot};
use crate::SvcError;
use async_trait::async_trait;
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use store_api::v0::{
    Machine, MachinePool, MachineStatus, MachineVolume, Port, StoragePoolType, ThinStoragePool,
    VolumeStatus, ROOT_VOLUME_INDEX,
};
use uuid::Uuid;

/// Shape of the `mem` driver spec
#[derive(Debug, Clone, Deserialize)]
struct MemDriverSpec {
    #[allow(dead_code)]
    driver: String,
    #[serde(default)]
    all_cores: i64,
    #[serde(default)]
    all_ram: i64,
    #[serde(default)]
    storage_pools: Vec<MemStoragePoolSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct MemStoragePoolSpec {
    name: String,
    capacity: u64,
    #[serde(default)]
    pool_type: StoragePoolType,
}

#[derive(Debug, Default)]
struct MemState {
    machines: HashMap<Uuid, Machine>,
    volumes: HashMap<Uuid, MachineVolume>,
    mutating_ops: u64,
}

/// One process-local hypervisor
#[derive(Debug, Clone)]
pub struct MemPoolDriver {
    info: PoolInfo,
    storage_specs: Vec<MemStoragePoolSpec>,
    state: Arc<Mutex<MemState>>,
}

impl MemPoolDriver {
    /// Constructor registered under the `mem` name
    pub fn factory(pool: &MachinePool) -> Result<Arc<dyn PoolDriver>, SvcError> {
        let spec: MemDriverSpec = serde_json::from_value(pool.driver_spec.clone())
            .map_err(|_| SvcError::InvalidDriverSpec { pool: pool.uuid })?;
        Ok(Arc::new(Self {
            info: PoolInfo {
                all_cores: spec.all_cores,
                all_ram: spec.all_ram,
            },
            storage_specs: spec.storage_pools,
            state: Arc::new(Mutex::new(MemState::default())),
        }))
    }

    /// Number of mutating operations performed so far, read-only
    /// snapshots excluded. Lets tests assert a steady state stays quiet.
    pub fn mutating_ops(&self) -> u64 {
        self.state.lock().expect("mem driver poisoned").mutating_ops
    }

    fn storage_pools_locked(&self, state: &MemState) -> Vec<ThinStoragePool> {
        self.storage_specs
            .iter()
            .map(|spec| {
                let ratio = spec.pool_type.oversubscription_ratio();
                let allocated: u64 = state.volumes.values().map(|v| v.size).sum();
                ThinStoragePool {
                    uuid: store_api::v0::uuid5(&Uuid::nil(), &spec.name),
                    name: spec.name.clone(),
                    capacity_usable: spec.capacity,
                    available_actual: spec.capacity as f64 - allocated as f64 / ratio,
                    pool_type: spec.pool_type,
                    oversubscription_ratio: ratio,
                }
            })
            .collect()
    }
}

#[async_trait]
impl PoolDriver for MemPoolDriver {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn get_pool_info(&self) -> Result<PoolInfo, DriverError> {
        Ok(self.info)
    }

    async fn list_pool_resources(&self) -> Result<PoolSnapshot, DriverError> {
        let state = self.state.lock().expect("mem driver poisoned");
        Ok(PoolSnapshot {
            info: self.info,
            storage_pools: self.storage_pools_locked(&state),
            machines: state.machines.values().cloned().collect(),
            volumes: state.volumes.values().cloned().collect(),
        })
    }

    async fn create_machine(
        &self,
        machine: &Machine,
        volumes: &[MachineVolume],
        _ports: &[Port],
    ) -> Result<Machine, DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        if let Some(existing) = state.machines.get(&machine.uuid) {
            // Present already, report it instead of re-creating
            return Ok(existing.clone());
        }
        match volumes.first() {
            Some(root) if root.index == ROOT_VOLUME_INDEX => root,
            _ => {
                return Err(DriverError::RootVolumeNotFound {
                    machine: machine.uuid,
                })
            }
        };
        state.mutating_ops += 1;
        let mut created = machine.clone();
        created.status = MachineStatus::Active;
        state.machines.insert(created.uuid, created.clone());
        for volume in volumes {
            let entry = state
                .volumes
                .entry(volume.uuid)
                .or_insert_with(|| volume.clone());
            entry.machine = Some(machine.uuid);
            entry.status = VolumeStatus::Active;
        }
        Ok(created)
    }

    async fn delete_machine(
        &self,
        machine: &Machine,
        delete_volumes: bool,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        if state.machines.remove(&machine.uuid).is_none() {
            // Not running or already gone, still a success
            return Ok(());
        }
        state.mutating_ops += 1;
        let attached: Vec<Uuid> = state
            .volumes
            .values()
            .filter(|v| v.machine == Some(machine.uuid))
            .map(|v| v.uuid)
            .collect();
        for uuid in attached {
            if delete_volumes {
                state.volumes.remove(&uuid);
            } else if let Some(volume) = state.volumes.get_mut(&uuid) {
                volume.machine = None;
            }
        }
        Ok(())
    }

    async fn get_machine(&self, machine: &Uuid) -> Result<Machine, DriverError> {
        self.state
            .lock()
            .expect("mem driver poisoned")
            .machines
            .get(machine)
            .cloned()
            .ok_or(DriverError::MachineNotFound { machine: *machine })
    }

    async fn create_volume(&self, volume: &MachineVolume) -> Result<MachineVolume, DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        if state.volumes.contains_key(&volume.uuid) {
            return Err(DriverError::VolumeAlreadyExists {
                volume: volume.uuid,
            });
        }
        state.mutating_ops += 1;
        let mut created = volume.clone();
        created.machine = None;
        created.status = VolumeStatus::Active;
        state.volumes.insert(created.uuid, created.clone());
        Ok(created)
    }

    async fn delete_volume(&self, volume: &MachineVolume) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        if state.volumes.remove(&volume.uuid).is_some() {
            state.mutating_ops += 1;
        }
        Ok(())
    }

    async fn resize_volume(&self, volume: &MachineVolume) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        let existing =
            state
                .volumes
                .get_mut(&volume.uuid)
                .ok_or(DriverError::VolumeNotFound {
                    volume: volume.uuid,
                })?;
        if volume.size < existing.size {
            return Err(DriverError::ShrinkForbidden {
                volume: volume.uuid,
                from: existing.size,
                to: volume.size,
            });
        }
        existing.size = volume.size;
        state.mutating_ops += 1;
        Ok(())
    }

    async fn attach_volume(&self, volume: &MachineVolume) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        let existing =
            state
                .volumes
                .get_mut(&volume.uuid)
                .ok_or(DriverError::VolumeNotFound {
                    volume: volume.uuid,
                })?;
        if existing.machine.is_some() {
            return Err(DriverError::VolumeAlreadyAttached {
                volume: volume.uuid,
            });
        }
        existing.machine = volume.machine;
        state.mutating_ops += 1;
        Ok(())
    }

    async fn detach_volume(&self, volume: &MachineVolume) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        let existing =
            state
                .volumes
                .get_mut(&volume.uuid)
                .ok_or(DriverError::VolumeNotFound {
                    volume: volume.uuid,
                })?;
        if existing.machine.is_none() {
            return Err(DriverError::VolumeNotAttached {
                volume: volume.uuid,
            });
        }
        existing.machine = None;
        state.mutating_ops += 1;
        Ok(())
    }

    async fn get_volume(&self, volume: &Uuid) -> Result<MachineVolume, DriverError> {
        self.state
            .lock()
            .expect("mem driver poisoned")
            .volumes
            .get(volume)
            .cloned()
            .ok_or(DriverError::VolumeNotFound { volume: *volume })
    }

    async fn set_machine_cores(&self, machine: &Machine, cores: u32) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        let existing = state
            .machines
            .get_mut(&machine.uuid)
            .ok_or(DriverError::MachineNotFound {
                machine: machine.uuid,
            })?;
        existing.cores = cores;
        // Recreate-based implementations carry the image over
        existing.image = machine.image.clone();
        state.mutating_ops += 1;
        Ok(())
    }

    async fn set_machine_ram(&self, machine: &Machine, ram: u64) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        let existing = state
            .machines
            .get_mut(&machine.uuid)
            .ok_or(DriverError::MachineNotFound {
                machine: machine.uuid,
            })?;
        existing.ram = ram;
        state.mutating_ops += 1;
        Ok(())
    }

    async fn rename_machine(&self, machine: &Machine, name: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        let existing = state
            .machines
            .get_mut(&machine.uuid)
            .ok_or(DriverError::MachineNotFound {
                machine: machine.uuid,
            })?;
        existing.name = name.to_string();
        state.mutating_ops += 1;
        Ok(())
    }

    async fn recreate_machine(&self, machine: &Machine) -> Result<(), DriverError> {
        let mut state = self.state.lock().expect("mem driver poisoned");
        let existing = state
            .machines
            .get_mut(&machine.uuid)
            .ok_or(DriverError::MachineNotFound {
                machine: machine.uuid,
            })?;
        // Uuid, ports and non-root volumes survive the rebuild
        existing.image = machine.image.clone();
        existing.status = MachineStatus::Active;
        state.mutating_ops += 1;
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
        let state = self.state.lock().expect("mem driver poisoned");
        Ok(self.storage_pools_locked(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_driver() -> MemPoolDriver {
        let mut pool = MachinePool::default();
        pool.driver_spec = serde_json::json!({
            "driver": "mem",
            "all_cores": 8,
            "all_ram": 16384,
            "storage_pools": [{ "name": "default", "capacity": 100, "pool_type": "dir" }],
        });
        let spec: MemDriverSpec = serde_json::from_value(pool.driver_spec.clone()).unwrap();
        MemPoolDriver {
            info: PoolInfo {
                all_cores: spec.all_cores,
                all_ram: spec.all_ram,
            },
            storage_specs: spec.storage_pools,
            state: Arc::new(Mutex::new(MemState::default())),
        }
    }

    fn root_volume() -> MachineVolume {
        let mut volume = MachineVolume::default();
        volume.index = ROOT_VOLUME_INDEX;
        volume.size = 10;
        volume
    }

    #[tokio::test]
    async fn create_machine_is_idempotent() {
        let driver = mem_driver();
        let machine = Machine::default();
        let volumes = vec![root_volume()];
        driver.create_machine(&machine, &volumes, &[]).await.unwrap();
        let ops = driver.mutating_ops();
        driver.create_machine(&machine, &volumes, &[]).await.unwrap();
        assert_eq!(driver.mutating_ops(), ops);
    }

    #[tokio::test]
    async fn create_machine_requires_root_volume() {
        let driver = mem_driver();
        let machine = Machine::default();
        let mut volume = root_volume();
        volume.index = 1;
        let err = driver
            .create_machine(&machine, &[volume], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::RootVolumeNotFound { .. }));
    }

    #[tokio::test]
    async fn attach_detach_round_trip() {
        let driver = mem_driver();
        let mut volume = root_volume();
        volume.index = 1;
        driver.create_volume(&volume).await.unwrap();
        volume.machine = Some(Uuid::new_v4());
        driver.attach_volume(&volume).await.unwrap();
        let err = driver.attach_volume(&volume).await.unwrap_err();
        assert!(err.already_in_target_state());
        driver.detach_volume(&volume).await.unwrap();
        let err = driver.detach_volume(&volume).await.unwrap_err();
        assert!(err.already_in_target_state());
        assert_eq!(driver.get_volume(&volume.uuid).await.unwrap().machine, None);
    }

    #[tokio::test]
    async fn resize_refuses_shrinking() {
        let driver = mem_driver();
        let mut volume = root_volume();
        driver.create_volume(&volume).await.unwrap();
        volume.size = 5;
        let err = driver.resize_volume(&volume).await.unwrap_err();
        assert!(matches!(err, DriverError::ShrinkForbidden { .. }));
        volume.size = 20;
        driver.resize_volume(&volume).await.unwrap();
        assert_eq!(driver.get_volume(&volume.uuid).await.unwrap().size, 20);
    }

    #[tokio::test]
    async fn deleted_machine_leaves_no_trace() {
        let driver = mem_driver();
        let machine = Machine::default();
        driver
            .create_machine(&machine, &[root_volume()], &[])
            .await
            .unwrap();
        driver.delete_machine(&machine, true).await.unwrap();
        let snapshot = driver.list_pool_resources().await.unwrap();
        assert!(snapshot.machines.is_empty());
        assert!(snapshot.volumes.is_empty());
        // deleting again is still a success
        driver.delete_machine(&machine, true).await.unwrap();
    }
}
