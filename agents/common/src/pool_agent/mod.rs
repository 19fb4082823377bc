//! Pool agent: owns the hypervisors behind its pools.
//!
//! Each iteration the agent rebuilds its view of every pool from one
//! driver snapshot, then walks its meta records and performs the
//! minimum driver operations to close the gap: create what is missing,
//! mutate what differs, copy observed state back, and delete what no
//! longer has intent behind it. Capacity failures never abort the turn;
//! they surface as statuses for the builders to act on.

use crate::{driver, errors::SvcError, IterationService};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Mutex,
};
use store_api::{v0::*, Store};
use uuid::Uuid;

pub mod meta;

use meta::{MetaMachine, MetaPool, MetaVolume, PoolState};

/// The pool agent service
pub struct PoolAgentService {
    uuid: Uuid,
    store: Store,
    meta_file: Option<PathBuf>,
    /// unknown data-plane machines seen exactly once; the second
    /// sighting deletes them, the gap is the recovery/migration gate
    pending_unknown: Mutex<HashSet<Uuid>>,
}

impl PoolAgentService {
    /// Pool agent with the identity `uuid`
    pub fn new(uuid: Uuid, store: Store, meta_file: Option<PathBuf>) -> Self {
        Self {
            uuid,
            store,
            meta_file,
            pending_unknown: Mutex::new(HashSet::new()),
        }
    }

    /// Identity of this agent
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Keep the agent registration alive so the scheduler can assign
    /// pools to it
    async fn register(&self) -> Result<(), SvcError> {
        let current = self.store.find_machine_agent(&self.uuid).await;
        let registered = current
            .as_ref()
            .map(|a| {
                a.status == MachineAgentStatus::Active
                    && a.capabilities.iter().any(|c| c == MACHINE_POOL_CAP)
            })
            .unwrap_or(false);
        if !registered {
            let mut agent = current.unwrap_or_default();
            agent.uuid = self.uuid;
            agent.name = format!("machine_pool_agent {}", &self.uuid.to_string()[..8]);
            agent.status = MachineAgentStatus::Active;
            agent.capabilities = vec![MACHINE_POOL_CAP.to_string()];
            self.store.save_machine_agent(agent).await?;
        }
        Ok(())
    }

    /// Build the per-pool runtime state from one driver snapshot
    async fn restore_pool(&self, target: &TargetResource) -> Result<PoolState, SvcError> {
        let mut meta = MetaPool::from_payload(target.uuid, &target.payload)?;
        let mut shell = MachinePool::default();
        shell.uuid = meta.uuid;
        shell.driver_spec = meta.driver_spec.clone();
        let driver = driver::load_driver(&shell)?;

        let snapshot = driver::with_timeout("list_pool_resources", driver.list_pool_resources())
            .await
            .map_err(|source| SvcError::DriverRequest {
                pool: meta.uuid,
                request: "list_pool_resources",
                source,
            })?;

        meta.aggregate(&snapshot.info, &snapshot.machines);
        meta.storage_pools = snapshot.storage_pools.clone();
        meta.status = MachinePoolStatus::Active;

        Ok(PoolState {
            meta,
            driver,
            dp_machines: snapshot.machines.into_iter().map(|m| (m.uuid, m)).collect(),
            dp_volumes: snapshot.volumes.into_iter().map(|v| (v.uuid, v)).collect(),
        })
    }

    /// Attach a volume, "already attached" is success
    async fn attach_volume(state: &PoolState, volume: &MachineVolume) -> bool {
        match driver::with_timeout("attach_volume", state.driver.attach_volume(volume)).await {
            Ok(()) => {
                tracing::info!(
                    "The volume {} attached to the machine {:?}",
                    volume.uuid,
                    volume.machine
                );
                true
            }
            Err(error) if error.already_in_target_state() => {
                tracing::warn!("The volume {} is already attached, do nothing", volume.uuid);
                true
            }
            Err(error) => {
                tracing::error!("Failed to attach volume {}: {}", volume.uuid, error);
                false
            }
        }
    }

    /// Detach a volume, "not attached" is success
    async fn detach_volume(state: &PoolState, volume: &MachineVolume) -> bool {
        match driver::with_timeout("detach_volume", state.driver.detach_volume(volume)).await {
            Ok(()) => {
                tracing::info!(
                    "The volume {} detached from the machine {:?}",
                    volume.uuid,
                    volume.machine
                );
                true
            }
            Err(error) if error.already_in_target_state() => {
                tracing::warn!("The volume {} is already detached, do nothing", volume.uuid);
                true
            }
            Err(error) => {
                tracing::error!("Failed to detach volume {}: {}", volume.uuid, error);
                false
            }
        }
    }

    /// Drive the attachment towards the desired machine
    async fn actualize_attachment(
        state: &PoolState,
        meta: &MetaVolume,
        dp_volume: &MachineVolume,
    ) {
        if meta.machine == dp_volume.machine {
            return;
        }

        // Detach only
        if meta.machine.is_none() {
            Self::detach_volume(state, dp_volume).await;
            return;
        }

        let mut desired = dp_volume.clone();
        desired.machine = meta.machine;

        // Attach only
        if dp_volume.machine.is_none() {
            Self::attach_volume(state, &desired).await;
            return;
        }

        // Reattach from one machine to another
        if Self::detach_volume(state, dp_volume).await {
            Self::attach_volume(state, &desired).await;
        }
    }

    /// Create the volume on the data plane
    async fn dump_volume(&self, state: &mut PoolState, meta: &mut MetaVolume) {
        if let Some(dp_volume) = state.dp_volumes.get(&meta.uuid) {
            // Present already, reuse it
            let dp_volume = dp_volume.clone();
            meta.restore_from(&dp_volume);
            self.finish_volume_attachment(state, meta, &dp_volume).await;
            return;
        }

        if !state.meta.has_storage(meta.size) {
            meta.status = VolumeStatus::Error;
            return;
        }

        let dp_volume = meta.to_dp_volume();
        match driver::with_timeout("create_volume", state.driver.create_volume(&dp_volume)).await
        {
            Ok(created) => {
                state.meta.allocate_storage(meta.size);
                meta.status = created.status;
                state.dp_volumes.insert(created.uuid, created.clone());
                tracing::info!("The volume {} created", meta.uuid);
                self.finish_volume_attachment(state, meta, &created).await;
            }
            Err(error) if error.already_in_target_state() => {
                meta.status = VolumeStatus::Active;
            }
            Err(error) => {
                tracing::error!("Failed to create volume {}: {}", meta.uuid, error);
            }
        }
    }

    /// Attach a freshly created or reused volume when its machine is
    /// present. Root volumes are attached by the driver during machine
    /// creation, never here.
    async fn finish_volume_attachment(
        &self,
        state: &PoolState,
        meta: &MetaVolume,
        dp_volume: &MachineVolume,
    ) {
        let machine = match meta.machine {
            Some(machine) => machine,
            None => return,
        };
        if !state.dp_machines.contains_key(&machine) {
            tracing::debug!("The machine {} doesn't exist, skip attaching", machine);
            return;
        }
        if meta.is_root() {
            return;
        }
        if dp_volume.machine != meta.machine {
            let mut desired = dp_volume.clone();
            desired.machine = meta.machine;
            Self::attach_volume(state, &desired).await;
        }
    }

    /// Converge an existing data-plane volume onto the meta record
    async fn update_volume(&self, state: &mut PoolState, meta: &mut MetaVolume) {
        let dp_volume = match state.dp_volumes.get(&meta.uuid) {
            Some(dp_volume) => dp_volume.clone(),
            None => return,
        };

        // A root volume whose machine is missing means machine creation
        // failed last turn; leave everything alone so the next turn can
        // retry the creation with the volume intact
        if meta.is_root()
            && meta
                .machine
                .map(|m| !state.dp_machines.contains_key(&m))
                .unwrap_or(false)
        {
            meta.restore_from(&dp_volume);
            return;
        }

        if meta.size != dp_volume.size {
            if meta.size < dp_volume.size {
                tracing::error!(
                    "Refusing to shrink volume {} from {} to {}",
                    meta.uuid,
                    dp_volume.size,
                    meta.size
                );
                meta.status = VolumeStatus::Error;
                return;
            }
            let delta = meta.size - dp_volume.size;
            if !state.meta.has_storage(delta) {
                meta.status = VolumeStatus::Error;
                return;
            }
            let mut desired = dp_volume.clone();
            desired.size = meta.size;
            match driver::with_timeout("resize_volume", state.driver.resize_volume(&desired))
                .await
            {
                Ok(()) => {
                    state.meta.allocate_storage(delta);
                    tracing::info!("The volume {} resized", meta.uuid);
                }
                Err(error) => {
                    tracing::error!("Failed to resize volume {}: {}", meta.uuid, error);
                    return;
                }
            }
        }

        if meta.machine != dp_volume.machine {
            Self::actualize_attachment(state, meta, &dp_volume).await;
        }

        match driver::with_timeout("get_volume", state.driver.get_volume(&meta.uuid)).await {
            Ok(refreshed) => {
                let machine = meta.machine;
                meta.restore_from(&refreshed);
                // Not all backends report attachments on a point get
                meta.machine = machine;
            }
            Err(error) => {
                tracing::error!("Failed to refresh volume {}: {}", meta.uuid, error);
            }
        }
    }

    /// Create the machine on the data plane
    async fn dump_machine(
        &self,
        state: &mut PoolState,
        meta: &mut MetaMachine,
        volumes: &[MetaVolume],
    ) {
        if state.dp_machines.contains_key(&meta.uuid) {
            // Not ordinary, but it happens during recovery or migration.
            // Let the update path handle it next iteration so there is a
            // chance to stop the service if something looks wrong.
            tracing::warn!(
                "Machine {} already exists in pool {:?}. It will be actualized on the next iteration.",
                meta.uuid,
                meta.pool
            );
            return;
        }

        let mut machine_volumes: Vec<&MetaVolume> = volumes
            .iter()
            .filter(|v| v.machine == Some(meta.uuid))
            .collect();
        machine_volumes.sort_by_key(|v| v.index);

        // Root volume must be the first
        let root = match machine_volumes.first() {
            Some(root) if root.index == ROOT_VOLUME_INDEX => root,
            _ => {
                tracing::error!("Root volume not found for machine {}", meta.uuid);
                meta.status = MachineStatus::Error;
                return;
            }
        };

        // Something went wrong with the root volume, the machine cannot
        // come up either
        if root.status == VolumeStatus::Error {
            meta.status = MachineStatus::Error;
            return;
        }

        // Without enough capacity the machine must be placed elsewhere;
        // that decision belongs to the scheduler, not the agent
        if !state
            .meta
            .has_resources(meta.cores as i64, meta.ram as i64)
        {
            meta.status = MachineStatus::NeedReschedule;
            return;
        }

        let dp_machine = meta.to_dp_machine();
        let dp_volumes: Vec<MachineVolume> =
            machine_volumes.iter().map(|v| v.to_dp_volume()).collect();
        let ports = [meta.to_port()];

        match driver::with_timeout(
            "create_machine",
            state.driver.create_machine(&dp_machine, &dp_volumes, &ports),
        )
        .await
        {
            Ok(created) => {
                state.meta.allocate_resources(meta.cores as i64, meta.ram as i64);
                meta.status = created.status;
                state.dp_machines.insert(created.uuid, created);
                tracing::info!("The machine {} created", meta.uuid);
            }
            Err(error) if error.already_in_target_state() => {
                meta.status = MachineStatus::Active;
            }
            Err(error) => {
                tracing::error!("Failed to create machine {}: {}", meta.uuid, error);
            }
        }
    }

    /// Converge an existing data-plane machine onto the meta record
    async fn update_machine(&self, state: &mut PoolState, meta: &mut MetaMachine) {
        let mut dp_machine = match state.dp_machines.get(&meta.uuid) {
            Some(dp_machine) => dp_machine.clone(),
            None => return,
        };

        if meta.cores != dp_machine.cores {
            // Growing a live machine needs headroom; unlike creation
            // there is no reschedule here since that would require
            // migrating the machine
            let need_cores = meta.cores as i64 - dp_machine.cores as i64;
            if !state.meta.has_resources(need_cores, 0) {
                meta.status = MachineStatus::Error;
                tracing::error!("Not enough cores to update the machine {}", meta.uuid);
                return;
            }

            // Legacy machines report no image; enrich them here so a
            // recreate-based resize does not lose the disk
            if dp_machine.image.is_none() {
                dp_machine.image = meta.image.clone();
                tracing::info!(
                    "Enriched legacy machine {} with image {:?}",
                    meta.uuid,
                    meta.image
                );
            }

            match driver::with_timeout(
                "set_machine_cores",
                state.driver.set_machine_cores(&dp_machine, meta.cores),
            )
            .await
            {
                Ok(()) => {
                    state.meta.allocate_resources(need_cores, 0);
                    tracing::info!("The machine {} cores updated", meta.uuid);
                }
                Err(error) => {
                    tracing::error!("Failed to update machine {} cores: {}", meta.uuid, error);
                    return;
                }
            }
        }

        if meta.ram != dp_machine.ram {
            let need_ram = meta.ram as i64 - dp_machine.ram as i64;
            if !state.meta.has_resources(0, need_ram) {
                meta.status = MachineStatus::Error;
                tracing::error!("Not enough RAM to update the machine {}", meta.uuid);
                return;
            }
            match driver::with_timeout(
                "set_machine_ram",
                state.driver.set_machine_ram(&dp_machine, meta.ram),
            )
            .await
            {
                Ok(()) => {
                    state.meta.allocate_resources(0, need_ram);
                    tracing::info!("The machine {} ram updated", meta.uuid);
                }
                Err(error) => {
                    tracing::error!("Failed to update machine {} ram: {}", meta.uuid, error);
                    return;
                }
            }
        }

        if dp_machine.image.is_some() && meta.image != dp_machine.image {
            // Recreate preserving uuid, ports and non-root volumes; the
            // guest flashes the new image on its next netboot
            let mut desired = dp_machine.clone();
            desired.image = meta.image.clone();
            match driver::with_timeout(
                "recreate_machine",
                state.driver.recreate_machine(&desired),
            )
            .await
            {
                Ok(()) => tracing::info!("The machine {} image updated", meta.uuid),
                Err(error) => {
                    tracing::error!("Failed to recreate machine {}: {}", meta.uuid, error);
                    return;
                }
            }
        }

        match driver::with_timeout("get_machine", state.driver.get_machine(&meta.uuid)).await {
            Ok(refreshed) => meta.restore_from(&refreshed),
            Err(error) => {
                tracing::error!("Failed to refresh machine {}: {}", meta.uuid, error);
            }
        }
    }

    /// Remove data-plane records that no longer have intent behind
    /// them. Unknown machines are deleted only on their second sighting.
    async fn delete_orphans(
        &self,
        state: &mut PoolState,
        machine_targets: &HashSet<Uuid>,
        volume_targets: &HashSet<Uuid>,
    ) {
        let unknown_machines: Vec<Machine> = state
            .dp_machines
            .values()
            .filter(|m| !machine_targets.contains(&m.uuid))
            .cloned()
            .collect();
        for machine in unknown_machines {
            let seen = {
                let mut pending = self.pending_unknown.lock().expect("agent state poisoned");
                !pending.insert(machine.uuid)
            };
            if !seen {
                tracing::warn!(
                    "Machine {} observed without a target record, deferring",
                    machine.uuid
                );
                continue;
            }
            match driver::with_timeout(
                "delete_machine",
                state.driver.delete_machine(&machine, true),
            )
            .await
            {
                Ok(()) => {
                    self.pending_unknown
                        .lock()
                        .expect("agent state poisoned")
                        .remove(&machine.uuid);
                    state.dp_machines.remove(&machine.uuid);
                    self.store
                        .delete_resource(ResourceKind::PoolMachine, &machine.uuid)
                        .await;
                    tracing::info!("The machine {} deleted", machine.uuid);
                }
                Err(error) => {
                    tracing::error!("Failed to delete machine {}: {}", machine.uuid, error);
                }
            }
        }

        let orphan_volumes: Vec<MachineVolume> = state
            .dp_volumes
            .values()
            .filter(|v| !volume_targets.contains(&v.uuid))
            .cloned()
            .collect();
        for volume in orphan_volumes {
            if volume.machine.is_some() {
                Self::detach_volume(state, &volume).await;
            }
            match driver::with_timeout("delete_volume", state.driver.delete_volume(&volume)).await
            {
                Ok(()) => {
                    state.dp_volumes.remove(&volume.uuid);
                    self.store
                        .delete_resource(ResourceKind::PoolVolume, &volume.uuid)
                        .await;
                    tracing::info!("The volume {} deleted", volume.uuid);
                }
                Err(error) => {
                    tracing::error!("Failed to delete volume {}: {}", volume.uuid, error);
                }
            }
        }
    }

    /// Drop actual rows whose target vanished while the data plane no
    /// longer holds the record either
    async fn prune_stale_actuals(&self, states: &HashMap<Uuid, PoolState>) {
        for kind in &[
            ResourceKind::Pool,
            ResourceKind::PoolVolume,
            ResourceKind::PoolMachine,
        ] {
            for resource in self.store.list_resources(*kind).await {
                if self
                    .store
                    .find_target_resource(*kind, &resource.uuid)
                    .await
                    .is_some()
                {
                    continue;
                }
                let on_dp = states.values().any(|s| {
                    s.dp_machines.contains_key(&resource.uuid)
                        || s.dp_volumes.contains_key(&resource.uuid)
                        || s.meta.uuid == resource.uuid
                });
                if !on_dp {
                    self.store.delete_resource(*kind, &resource.uuid).await;
                }
            }
        }
    }

    /// Persist a JSON snapshot of the meta records for restart recovery
    fn persist_meta(&self, states: &HashMap<Uuid, PoolState>) {
        let path = match &self.meta_file {
            Some(path) => path,
            None => return,
        };
        let pools: Vec<&MetaPool> = states.values().map(|s| &s.meta).collect();
        match serde_json::to_vec_pretty(&pools) {
            Ok(bytes) => {
                if let Err(error) = std::fs::write(path, bytes) {
                    tracing::warn!("Failed to persist agent meta file: {}", error);
                }
            }
            Err(error) => tracing::warn!("Failed to serialise agent meta: {}", error),
        }
    }

    async fn run_iteration(&self) -> Result<(), SvcError> {
        self.register().await?;

        let targets = self.store.list_agent_target_resources(&self.uuid).await;
        let pool_targets: Vec<&TargetResource> =
            targets.iter().filter(|t| t.kind == ResourceKind::Pool).collect();
        let mut volume_targets: Vec<&TargetResource> = targets
            .iter()
            .filter(|t| t.kind == ResourceKind::PoolVolume)
            .collect();
        let machine_targets: Vec<&TargetResource> = targets
            .iter()
            .filter(|t| t.kind == ResourceKind::PoolMachine)
            .collect();

        let mut states: HashMap<Uuid, PoolState> = HashMap::new();
        for target in &pool_targets {
            match self.restore_pool(*target).await {
                Ok(state) => {
                    self.store
                        .save_resource(Resource::new(
                            ResourceKind::Pool,
                            state.meta.uuid,
                            state.meta.observation(),
                        ))
                        .await;
                    states.insert(state.meta.uuid, state);
                }
                Err(error) => {
                    tracing::error!("Failed to load pool {}: {}", target.uuid, error);
                }
            }
        }

        // Root volumes first so machine creation finds them ready
        volume_targets.sort_by_key(|t| {
            t.payload
                .get("index")
                .and_then(|i| i.as_u64())
                .unwrap_or(UNKNOWN_VOLUME_INDEX as u64)
        });

        let mut metas: Vec<MetaVolume> = vec![];
        for target in &volume_targets {
            let mut meta = match MetaVolume::from_payload(target.uuid, &target.payload) {
                Ok(meta) => meta,
                Err(error) => {
                    tracing::error!("Skipping volume {}: {}", target.uuid, error);
                    continue;
                }
            };
            let state = match meta.pool.and_then(|p| states.get_mut(&p)) {
                Some(state) => state,
                None => {
                    tracing::debug!("Volume {} belongs to an unknown pool, skipping", meta.uuid);
                    continue;
                }
            };
            if state.dp_volumes.contains_key(&meta.uuid) {
                self.update_volume(state, &mut meta).await;
            } else {
                self.dump_volume(state, &mut meta).await;
            }
            self.store
                .save_resource(Resource::new(
                    ResourceKind::PoolVolume,
                    meta.uuid,
                    meta.observation(),
                ))
                .await;
            metas.push(meta);
        }

        for target in &machine_targets {
            let mut meta = match MetaMachine::from_payload(target.uuid, &target.payload) {
                Ok(meta) => meta,
                Err(error) => {
                    tracing::error!("Skipping machine {}: {}", target.uuid, error);
                    continue;
                }
            };
            let state = match meta.pool.and_then(|p| states.get_mut(&p)) {
                Some(state) => state,
                None => {
                    tracing::debug!("Machine {} belongs to an unknown pool, skipping", meta.uuid);
                    continue;
                }
            };
            if state.dp_machines.contains_key(&meta.uuid) {
                self.update_machine(state, &mut meta).await;
            } else {
                self.dump_machine(state, &mut meta, &metas).await;
            }
            self.store
                .save_resource(Resource::new(
                    ResourceKind::PoolMachine,
                    meta.uuid,
                    meta.observation(),
                ))
                .await;
        }

        let machine_uuids: HashSet<Uuid> = machine_targets.iter().map(|t| t.uuid).collect();
        let volume_uuids: HashSet<Uuid> = volume_targets.iter().map(|t| t.uuid).collect();
        for state in states.values_mut() {
            self.delete_orphans(state, &machine_uuids, &volume_uuids).await;
        }

        self.prune_stale_actuals(&states).await;
        self.persist_meta(&states);
        Ok(())
    }
}

#[async_trait]
impl IterationService for PoolAgentService {
    fn name(&self) -> &str {
        "pool-agent"
    }

    async fn iteration(&self) -> Result<(), SvcError> {
        self.run_iteration().await
    }
}
