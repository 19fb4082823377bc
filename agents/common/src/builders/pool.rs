//! Pool builder: admits machines and volumes into the pools it owns,
//! materialises the hypervisor and guest derivatives of every machine,
//! actualises boot modes and rolls observed status back up.

use crate::{
    errors::{InvalidPayload, SvcError},
    reconciler::{find_pair, Derivative, DerivativePair, InstanceBuilder, InstanceSpec},
};
use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;
use std::{collections::HashMap, sync::Mutex};
use store_api::{v0::*, Store};
use uuid::Uuid;

/// Kinds owned by the pool builder, in dependency order
const KINDS: [ResourceKind; 3] = [
    ResourceKind::Pool,
    ResourceKind::PoolVolume,
    ResourceKind::Machine,
];

/// Derivatives materialised for every machine
const MACHINE_DERIVATIVES: [ResourceKind; 2] =
    [ResourceKind::PoolMachine, ResourceKind::GuestMachine];

/// Observed pool fields the agent reports back
#[derive(Debug, Deserialize)]
struct PoolObservation {
    #[serde(default)]
    all_cores: i64,
    #[serde(default)]
    all_ram: i64,
    #[serde(default)]
    avail_cores: i64,
    #[serde(default)]
    avail_ram: i64,
    #[serde(default)]
    storage_pools: Vec<ThinStoragePool>,
    #[serde(default = "default_pool_status")]
    status: MachinePoolStatus,
}

fn default_pool_status() -> MachinePoolStatus {
    MachinePoolStatus::Active
}

/// Per-iteration context: the pools this builder owns, mutated locally
/// as capacity is handed out within the turn
pub struct PoolBuilderContext {
    pools: Mutex<HashMap<Uuid, MachinePool>>,
}

impl PoolBuilderContext {
    fn pool(&self, uuid: Option<Uuid>) -> Option<MachinePool> {
        let uuid = uuid?;
        self.pools.lock().expect("pool context poisoned").get(&uuid).cloned()
    }

    fn agent_by_pool(&self, uuid: Option<Uuid>) -> Option<Uuid> {
        self.pool(uuid).and_then(|p| p.agent)
    }

    fn debit_storage(&self, uuid: Uuid, size: u64) {
        if let Some(pool) = self
            .pools
            .lock()
            .expect("pool context poisoned")
            .get_mut(&uuid)
        {
            if let Some(storage) = pool.storage_pools.first_mut() {
                storage.allocate_capacity(size);
            }
        }
    }

    fn has_cores_ram(&self, uuid: Option<Uuid>, cores: i64, ram: i64) -> bool {
        self.pool(uuid)
            .map(|p| p.avail_cores >= cores && p.avail_ram >= ram)
            .unwrap_or(false)
    }

    fn has_storage(&self, uuid: Option<Uuid>, size: u64) -> bool {
        self.pool(uuid)
            .and_then(|p| p.storage_pools.first().map(|s| s.has_capacity(size)))
            .unwrap_or(false)
    }
}

/// The pool builder
pub struct PoolBuilder {
    uuid: Uuid,
}

impl PoolBuilder {
    /// Pool builder with the service identity `uuid`
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    /// Service identity of this builder
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Ports and volumes a machine depends on, volumes sorted by index
    async fn fetch_machine_deps(
        store: &Store,
        machine: &Machine,
    ) -> (Vec<Port>, Vec<MachineVolume>) {
        let ports: Vec<Port> = store
            .list_ports()
            .await
            .into_iter()
            .filter(|p| p.node.is_some() && p.node == machine.node)
            .collect();
        let mut volumes: Vec<MachineVolume> = store
            .list_machine_volumes()
            .await
            .into_iter()
            .filter(|v| v.machine == Some(machine.uuid))
            .collect();
        volumes.sort_by_key(|v| v.index);
        (ports, volumes)
    }

    /// Release the machine so the scheduler may pick another pool
    async fn reschedule_machine(store: &Store, machine: &Uuid) {
        if store.delete_machine(machine).await.is_some() {
            tracing::info!("Machine {} released back to the scheduler", machine);
        }
    }

    async fn can_create_machine(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        ctx: &PoolBuilderContext,
    ) -> Result<bool, SvcError> {
        let machine = match store.find_machine(&instance.uuid).await {
            Some(machine) => machine,
            None => return Ok(false),
        };

        // The gate only applies on creation: a pool the scheduler missed
        // is handled by releasing the machine, not by failing it
        if !ctx.has_cores_ram(machine.pool, machine.cores as i64, machine.ram as i64) {
            tracing::warn!("Pool {:?} has not enough resources", machine.pool);
            Self::reschedule_machine(store, &machine.uuid).await;
            return Ok(false);
        }

        let (ports, volumes) = Self::fetch_machine_deps(store, &machine).await;
        if ports.is_empty() || volumes.is_empty() {
            tracing::warn!("Machine {} deps are not ready", machine.uuid);
            return Ok(false);
        }
        if ports[0].status != PortStatus::Active {
            tracing::debug!("Port {} is not active", ports[0].uuid);
            return Ok(false);
        }
        Ok(true)
    }

    async fn can_create_volume(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        ctx: &PoolBuilderContext,
    ) -> Result<bool, SvcError> {
        let volume = match store.find_machine_volume(&instance.uuid).await {
            Some(volume) => volume,
            None => return Ok(false),
        };

        if !ctx.has_storage(volume.pool, volume.size) {
            tracing::warn!("Pool {:?} has not enough space", volume.pool);
            // Root volumes take their machine with them so the whole
            // placement is retried together
            if volume.index == ROOT_VOLUME_INDEX {
                if let Some(machine) = volume.machine {
                    Self::reschedule_machine(store, &machine).await;
                }
            }
            store.delete_machine_volume(&volume.uuid).await;
            return Ok(false);
        }

        if let Some(pool) = volume.pool {
            ctx.debit_storage(pool, volume.size);
        }
        Ok(true)
    }

    async fn can_update_machine(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        target: &TargetResource,
        ctx: &PoolBuilderContext,
    ) -> Result<bool, SvcError> {
        let machine = match store.find_machine(&instance.uuid).await {
            Some(machine) => machine,
            None => return Ok(false),
        };
        let old_cores = target.payload.get("cores").and_then(|v| v.as_i64()).unwrap_or(0);
        let old_ram = target.payload.get("ram").and_then(|v| v.as_i64()).unwrap_or(0);
        let need_cores = machine.cores as i64 - old_cores;
        let need_ram = machine.ram as i64 - old_ram;

        if !ctx.has_cores_ram(machine.pool, need_cores, need_ram) {
            // No reschedule during update, the machine may be stateful
            // and live migration is not supported
            tracing::warn!("Pool {:?} has not enough resources", machine.pool);
            let mut machine = machine;
            machine.status = MachineStatus::Error;
            let node = machine.node;
            store.update_machine(machine).await?;
            if let Some(node_uuid) = node {
                if let Some(mut node) = store.find_node(&node_uuid).await {
                    node.status = NodeStatus::Error;
                    store.update_node(node).await?;
                }
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn can_update_volume(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        target: &TargetResource,
        ctx: &PoolBuilderContext,
    ) -> Result<bool, SvcError> {
        let volume = match store.find_machine_volume(&instance.uuid).await {
            Some(volume) => volume,
            None => return Ok(false),
        };
        let old_size = target.payload.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
        let need = volume.size.saturating_sub(old_size);

        if need > 0 && !ctx.has_storage(volume.pool, need) {
            tracing::warn!("Pool {:?} has not enough space", volume.pool);
            let mut volume = volume;
            volume.status = VolumeStatus::Error;
            let node_volume = volume.node_volume;
            store.update_machine_volume(volume).await?;
            if let Some(user_volume) = node_volume {
                if let Some(mut user_volume) = store.find_volume(&user_volume).await {
                    user_volume.status = VolumeStatus::Error;
                    store.update_volume(user_volume).await?;
                }
            }
            return Ok(false);
        }

        if let (Some(pool), true) = (volume.pool, need > 0) {
            ctx.debit_storage(pool, need);
        }
        Ok(true)
    }

    /// Materialise the machine derivatives for create and update.
    /// New machines and machines whose root image changed boot from the
    /// network until the guest flashes; the pool machine always netboots
    /// since the hypervisor chains from the guest firmware.
    async fn machine_derivatives(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        pairs: &[DerivativePair],
        ctx: &PoolBuilderContext,
    ) -> Result<Vec<Derivative>, SvcError> {
        let mut machine = match store.find_machine(&instance.uuid).await {
            Some(machine) => machine,
            None => return Ok(vec![]),
        };
        let (ports, volumes) = Self::fetch_machine_deps(store, &machine).await;
        let port = ports
            .first()
            .ok_or(SvcError::MachineNotFound { machine: machine.uuid })?;
        let root = volumes
            .iter()
            .find(|v| v.index == ROOT_VOLUME_INDEX)
            .ok_or(SvcError::RootVolumeNotFound { machine: machine.uuid })?;

        let agent_uuid = ctx.agent_by_pool(machine.pool);

        let mut pool_machine = PoolMachine::from_machine_and_port(&machine, port);
        pool_machine.image = root.image.clone();

        // Keep a placeholder agent for the guest so its resources have a
        // scheduling anchor before the in-VM agent first reports in
        if store.find_machine_agent(&machine.uuid).await.is_none() {
            let mut guest_agent = MachineAgent::default();
            guest_agent.uuid = machine.uuid;
            guest_agent.name = "dummy-node-agent".into();
            store.save_machine_agent(guest_agent).await?;
        }

        let guest_pair = find_pair(pairs, ResourceKind::GuestMachine);
        let boot = match guest_pair {
            // A new machine always starts from the network
            None => BootAlternative::Network,
            Some(pair) => {
                let flashed_image = pair
                    .actual
                    .as_ref()
                    .and_then(|a| a.payload.get("image"))
                    .and_then(|i| i.as_str());
                match flashed_image {
                    Some(image) if Some(image) != root.image.as_deref() => {
                        BootAlternative::Network
                    }
                    _ => machine.boot,
                }
            }
        };

        let hostname = match machine.node {
            Some(node) => store
                .find_node(&node)
                .await
                .map(|n| n.hostname.unwrap_or(n.name)),
            None => None,
        };
        let guest = GuestMachine {
            uuid: machine.uuid,
            image: root.image.clone(),
            hostname,
            boot,
            status: MachineStatus::New,
        };

        if machine.boot != boot || machine.image != root.image {
            machine.boot = boot;
            machine.image = root.image.clone();
            store.update_machine(machine.clone()).await?;
        }

        Ok(vec![
            Derivative {
                kind: ResourceKind::PoolMachine,
                uuid: machine.uuid,
                payload: pool_machine.target_payload(),
                agent: agent_uuid,
            },
            Derivative {
                kind: ResourceKind::GuestMachine,
                uuid: machine.uuid,
                payload: guest.target_payload(),
                agent: Some(machine.uuid),
            },
        ])
    }

    /// Join of the derivative statuses: errors dominate, activity
    /// requires both sides
    fn join_machine_status(
        pool_machine: Option<MachineStatus>,
        guest_machine: Option<MachineStatus>,
    ) -> Option<MachineStatus> {
        let (pool, guest) = (pool_machine?, guest_machine?);
        Some(match (pool, guest) {
            (MachineStatus::Error, _) | (_, MachineStatus::Error) => MachineStatus::Error,
            (MachineStatus::New, _) | (_, MachineStatus::New) => MachineStatus::New,
            (MachineStatus::Active, MachineStatus::Active) => MachineStatus::Active,
            _ => MachineStatus::InProgress,
        })
    }

    fn actual_status(pair: Option<&DerivativePair>) -> Option<MachineStatus> {
        pair?
            .actual
            .as_ref()?
            .status()?
            .parse::<MachineStatus>()
            .ok()
    }
}

#[async_trait]
impl InstanceBuilder for PoolBuilder {
    type Context = PoolBuilderContext;

    fn name(&self) -> &str {
        "pool-builder"
    }

    fn kinds(&self) -> &[ResourceKind] {
        &KINDS
    }

    fn derivative_kinds(&self, kind: ResourceKind) -> &'static [ResourceKind] {
        match kind {
            ResourceKind::Machine => &MACHINE_DERIVATIVES,
            _ => &[],
        }
    }

    async fn prepare_iteration(&self, store: &Store) -> Result<Self::Context, SvcError> {
        // Re-register every turn; the scheduler drops all builders at
        // each rebalance point
        if store.find_builder(&self.uuid).await.is_none() {
            let mut builder = Builder::default();
            builder.uuid = self.uuid;
            builder.name = format!(
                "{} {}",
                crate::POOL_BUILDER_PREFIX,
                &self.uuid.to_string()[..8]
            );
            builder.status = BuilderStatus::Active;
            store.save_builder(builder).await?;
        }

        let pools = store
            .list_pools()
            .await
            .into_iter()
            .filter(|p| p.builder == Some(self.uuid))
            .map(|p| (p.uuid, p))
            .collect();
        Ok(PoolBuilderContext {
            pools: Mutex::new(pools),
        })
    }

    async fn instances(
        &self,
        store: &Store,
        kind: ResourceKind,
        ctx: &Self::Context,
    ) -> Result<Vec<InstanceSpec>, SvcError> {
        let owned: Vec<Uuid> = ctx
            .pools
            .lock()
            .expect("pool context poisoned")
            .keys()
            .cloned()
            .collect();
        let specs = match kind {
            ResourceKind::Pool => ctx
                .pools
                .lock()
                .expect("pool context poisoned")
                .values()
                .map(|pool| {
                    let mut spec =
                        InstanceSpec::new(kind, pool.uuid, pool.target_payload());
                    spec.agent = pool.agent;
                    spec
                })
                .collect(),
            ResourceKind::PoolVolume => store
                .list_machine_volumes()
                .await
                .into_iter()
                .filter(|v| v.pool.map(|p| owned.contains(&p)).unwrap_or(false))
                .map(|volume| {
                    let mut spec =
                        InstanceSpec::new(kind, volume.uuid, volume.target_payload());
                    spec.agent = ctx.agent_by_pool(volume.pool);
                    spec
                })
                .collect(),
            ResourceKind::Machine => store
                .list_machines()
                .await
                .into_iter()
                .filter(|m| m.pool.map(|p| owned.contains(&p)).unwrap_or(false))
                .map(|machine| {
                    let mut spec =
                        InstanceSpec::new(kind, machine.uuid, machine.target_payload());
                    spec.agent = ctx.agent_by_pool(machine.pool);
                    spec
                })
                .collect(),
            _ => vec![],
        };
        Ok(specs)
    }

    async fn can_create(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        ctx: &Self::Context,
    ) -> Result<bool, SvcError> {
        match instance.kind {
            ResourceKind::Machine => self.can_create_machine(store, instance, ctx).await,
            ResourceKind::PoolVolume => self.can_create_volume(store, instance, ctx).await,
            _ => Ok(true),
        }
    }

    async fn can_update(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        target: &TargetResource,
        ctx: &Self::Context,
    ) -> Result<bool, SvcError> {
        match instance.kind {
            ResourceKind::Machine => self.can_update_machine(store, instance, target, ctx).await,
            ResourceKind::PoolVolume => {
                self.can_update_volume(store, instance, target, ctx).await
            }
            _ => Ok(true),
        }
    }

    async fn derivatives(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        pairs: &[DerivativePair],
        ctx: &Self::Context,
    ) -> Result<Vec<Derivative>, SvcError> {
        match instance.kind {
            ResourceKind::Machine => self.machine_derivatives(store, instance, pairs, ctx).await,
            _ => Ok(vec![]),
        }
    }

    async fn actualize_outdated(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        actual: &store_api::v0::Resource,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        match instance.kind {
            ResourceKind::Pool => {
                let observed: PoolObservation = serde_json::from_value(actual.payload.clone())
                    .context(InvalidPayload {
                        kind: instance.kind.to_string(),
                        uuid: instance.uuid,
                    })?;
                if let Some(mut pool) = store.find_pool(&instance.uuid).await {
                    pool.all_cores = observed.all_cores;
                    pool.all_ram = observed.all_ram;
                    pool.avail_cores = observed.avail_cores;
                    pool.avail_ram = observed.avail_ram;
                    pool.storage_pools = observed.storage_pools;
                    pool.status = observed.status;
                    store.update_pool(pool).await?;
                }
            }
            ResourceKind::PoolVolume => {
                let status = actual
                    .status()
                    .and_then(|s| s.parse::<VolumeStatus>().ok());
                if let (Some(status), Some(mut volume)) =
                    (status, store.find_machine_volume(&instance.uuid).await)
                {
                    if volume.status != status {
                        volume.status = status;
                        store.update_machine_volume(volume).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn actualize_outdated_derivatives(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        pairs: &[DerivativePair],
        ctx: &Self::Context,
    ) -> Result<Vec<Derivative>, SvcError> {
        let mut machine = match store.find_machine(&instance.uuid).await {
            Some(machine) => machine,
            None => return Ok(vec![]),
        };
        let pool_pair = find_pair(pairs, ResourceKind::PoolMachine);
        let guest_pair = find_pair(pairs, ResourceKind::GuestMachine);
        let (pool_pair, guest_pair) = match (pool_pair, guest_pair) {
            (Some(pool), Some(guest)) => (pool, guest),
            _ => return Ok(vec![]),
        };

        let pool_status = Self::actual_status(Some(pool_pair));
        let guest_status = Self::actual_status(Some(guest_pair));

        // The pool lost the machine for good; release it so the
        // scheduler can try again elsewhere
        if pool_status == Some(MachineStatus::NeedReschedule) {
            Self::reschedule_machine(store, &machine.uuid).await;
            return Ok(vec![]);
        }

        let mut guest_target: GuestMachine =
            serde_json::from_value(guest_pair.target.payload.clone()).context(
                InvalidPayload {
                    kind: guest_pair.target.kind.to_string(),
                    uuid: instance.uuid,
                },
            )?;
        let pool_target: PoolMachine = serde_json::from_value(pool_pair.target.payload.clone())
            .context(InvalidPayload {
                kind: pool_pair.target.kind.to_string(),
                uuid: instance.uuid,
            })?;

        let mut changed = false;

        // The guest flashed its root disk over the network boot; flip
        // the control-plane boot to the first disk. The hypervisor keeps
        // netbooting and chains into the guest firmware.
        let guest_boot = guest_pair
            .actual
            .as_ref()
            .and_then(|a| a.payload.get("boot"))
            .and_then(|b| serde_json::from_value::<BootAlternative>(b.clone()).ok());
        if guest_boot == Some(BootAlternative::Network)
            && guest_status == Some(MachineStatus::Flashed)
            && machine.boot == BootAlternative::Network
        {
            machine.boot = BootAlternative::Hd0;
            guest_target.boot = BootAlternative::Hd0;
            changed = true;
        }

        if let Some(status) = Self::join_machine_status(pool_status, guest_status) {
            if machine.status != status {
                machine.status = status;
                changed = true;
            }
        }

        if changed {
            store.update_machine(machine.clone()).await?;
        }

        Ok(vec![
            Derivative {
                kind: ResourceKind::PoolMachine,
                uuid: machine.uuid,
                payload: pool_target.target_payload(),
                agent: ctx.agent_by_pool(machine.pool),
            },
            Derivative {
                kind: ResourceKind::GuestMachine,
                uuid: machine.uuid,
                payload: guest_target.target_payload(),
                agent: Some(machine.uuid),
            },
        ])
    }

    async fn pre_delete(&self, store: &Store, target: &TargetResource) -> Result<(), SvcError> {
        if target.kind != ResourceKind::Machine {
            return Ok(());
        }
        // The in-VM agent loses power before it can observe its own
        // deletion, so its records are removed explicitly
        store.delete_machine_agent(&target.uuid).await;
        store
            .delete_resource(ResourceKind::GuestMachine, &target.uuid)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_join_error_dominates() {
        assert_eq!(
            PoolBuilder::join_machine_status(
                Some(MachineStatus::Error),
                Some(MachineStatus::Active)
            ),
            Some(MachineStatus::Error)
        );
        assert_eq!(
            PoolBuilder::join_machine_status(
                Some(MachineStatus::Active),
                Some(MachineStatus::Error)
            ),
            Some(MachineStatus::Error)
        );
    }

    #[test]
    fn status_join_requires_both_for_active() {
        assert_eq!(
            PoolBuilder::join_machine_status(
                Some(MachineStatus::Active),
                Some(MachineStatus::Active)
            ),
            Some(MachineStatus::Active)
        );
        assert_eq!(
            PoolBuilder::join_machine_status(
                Some(MachineStatus::Active),
                Some(MachineStatus::InProgress)
            ),
            Some(MachineStatus::InProgress)
        );
    }

    #[test]
    fn status_join_new_beats_in_progress() {
        assert_eq!(
            PoolBuilder::join_machine_status(
                Some(MachineStatus::New),
                Some(MachineStatus::InProgress)
            ),
            Some(MachineStatus::New)
        );
    }

    #[test]
    fn status_join_needs_both_sides() {
        assert_eq!(
            PoolBuilder::join_machine_status(Some(MachineStatus::Active), None),
            None
        );
    }
}
