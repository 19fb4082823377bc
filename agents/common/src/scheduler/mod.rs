//! Placement of unscheduled nodes and volumes onto pools.
//!
//! The scheduler runs periodically and on each turn: admits fresh pools
//! to a builder and an agent, binds nodes to pre-existing idle machines
//! where possible, places the remaining virtual nodes through the
//! filter then weight pipeline, co-locates unbound volumes with their
//! node's pool, and periodically drops every builder registration so
//! dead builders are evicted.

use crate::{errors::SvcError, IterationService};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use store_api::{v0::*, Store};
use uuid::Uuid;

pub mod filters;
pub mod weighters;

use filters::{MachineFilter, PoolFilter};
use weighters::{MachineWeighter, PoolWeighter};

/// Builders are dropped wholesale every this many iterations, forcing
/// the live ones to re-register and evicting the dead ones
pub const BUILDER_REBALANCE_RATE: u64 = 100;

/// An unscheduled node together with its user volumes
#[derive(Debug, Clone)]
pub struct NodeBundle {
    /// the node to place
    pub node: Node,
    /// user volumes belonging to the node
    pub volumes: Vec<Volume>,
}

/// A candidate pool together with its reusable unbound volumes
#[derive(Debug, Clone)]
pub struct PoolBundle {
    /// the candidate pool
    pub pool: MachinePool,
    /// pool volumes not bound to any machine or user volume
    pub volumes: Vec<MachineVolume>,
}

/// A candidate idle machine
#[derive(Debug, Clone)]
pub struct MachineBundle {
    /// the idle machine
    pub machine: Machine,
}

/// Pick a random element, spreading load across candidates
fn choose<T>(items: &[T]) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    let seed = Uuid::new_v4().as_bytes()[15] as usize;
    items.get(seed % items.len())
}

/// Index of the highest weight, first index wins ties
fn best_index(weights: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, &weight) in weights.iter().enumerate() {
        match best {
            Some((_, w)) if weight <= w => {}
            _ => best = Some((index, weight)),
        }
    }
    best.map(|(index, _)| index)
}

/// The scheduler service
pub struct SchedulerService {
    store: Store,
    pool_filters: Vec<Box<dyn PoolFilter>>,
    pool_weighters: Vec<Box<dyn PoolWeighter>>,
    machine_filters: Vec<Box<dyn MachineFilter>>,
    machine_weighters: Vec<Box<dyn MachineWeighter>>,
    iteration_count: AtomicU64,
}

impl SchedulerService {
    /// Scheduler with an explicit pipeline
    pub fn new(
        store: Store,
        pool_filters: Vec<Box<dyn PoolFilter>>,
        pool_weighters: Vec<Box<dyn PoolWeighter>>,
        machine_filters: Vec<Box<dyn MachineFilter>>,
        machine_weighters: Vec<Box<dyn MachineWeighter>>,
    ) -> Self {
        Self {
            store,
            pool_filters,
            pool_weighters,
            machine_filters,
            machine_weighters,
            iteration_count: AtomicU64::new(0),
        }
    }

    /// Scheduler with the default pipeline
    pub fn with_defaults(store: Store) -> Self {
        Self::new(
            store,
            vec![
                Box::new(filters::CoresRamAvailableFilter::default()),
                Box::new(filters::SoftAntiAffinityFilter::default()),
            ],
            vec![Box::new(weighters::RelativeCoreRamWeighter::default())],
            vec![Box::new(filters::HwCoresRamAvailableFilter::default())],
            vec![Box::new(weighters::UniformMachineWeighter::default())],
        )
    }

    async fn active_builders(&self) -> Vec<Builder> {
        self.store
            .list_builders()
            .await
            .into_iter()
            .filter(|b| b.status == BuilderStatus::Active)
            .collect()
    }

    fn with_prefix(builders: &[Builder], prefix: &str) -> Vec<Builder> {
        builders
            .iter()
            .filter(|b| b.name.starts_with(prefix))
            .cloned()
            .collect()
    }

    async fn pool_capable_agents(&self) -> Vec<MachineAgent> {
        self.store
            .list_machine_agents()
            .await
            .into_iter()
            .filter(|a| {
                a.status == MachineAgentStatus::Active
                    && a.capabilities.iter().any(|c| c == MACHINE_POOL_CAP)
            })
            .collect()
    }

    /// Candidate pools with their reusable volumes
    async fn pool_bundles(&self) -> Vec<PoolBundle> {
        let volumes = self.store.list_machine_volumes().await;
        self.store
            .list_pools()
            .await
            .into_iter()
            .filter(|p| {
                p.status == MachinePoolStatus::Active
                    && p.machine_type == NodeType::Vm
                    && p.builder.is_some()
                    && p.has_driver()
            })
            .map(|pool| {
                let volumes = volumes
                    .iter()
                    .filter(|v| {
                        v.pool == Some(pool.uuid)
                            && v.machine.is_none()
                            && v.node_volume.is_none()
                    })
                    .cloned()
                    .collect();
                PoolBundle { pool, volumes }
            })
            .collect()
    }

    /// Nodes with no machine bound to them yet
    async fn unscheduled_nodes(&self) -> Result<Vec<NodeBundle>, SvcError> {
        let machines = self.store.list_machines().await;
        let volumes = self.store.list_volumes().await;
        let mut bundles = vec![];
        for node in self.store.list_nodes().await {
            if machines.iter().any(|m| m.node == Some(node.uuid)) {
                continue;
            }
            let node_volumes = volumes
                .iter()
                .filter(|v| v.node == Some(node.uuid))
                .cloned()
                .collect();
            bundles.push(NodeBundle {
                node,
                volumes: node_volumes,
            });
        }
        Ok(bundles)
    }

    async fn idle_machines(&self) -> Vec<MachineBundle> {
        self.store
            .list_machines()
            .await
            .into_iter()
            .filter(|m| m.node.is_none() && m.status == MachineStatus::Idle)
            .map(|machine| MachineBundle { machine })
            .collect()
    }

    /// Assign a builder and an agent to pools that have neither.
    /// Writes are idempotent so concurrent schedulers converge.
    async fn schedule_pools(&self, builders: &[Builder]) -> Result<(), SvcError> {
        let agents = self.pool_capable_agents().await;
        for mut pool in self.store.list_pools().await {
            let mut changed = false;
            if pool.builder.is_none() {
                match choose(builders) {
                    Some(builder) => {
                        pool.builder = Some(builder.uuid);
                        changed = true;
                    }
                    None => {
                        tracing::warn!("No pool builders found to schedule pool {}", pool.uuid);
                    }
                }
            }
            if pool.agent.is_none() {
                match choose(&agents) {
                    Some(agent) => {
                        pool.agent = Some(agent.uuid);
                        changed = true;
                    }
                    None => {
                        tracing::warn!("No machine agents found to schedule pool {}", pool.uuid);
                    }
                }
            }
            if changed {
                let pool_uuid = pool.uuid;
                let (builder, agent) = (pool.builder, pool.agent);
                self.store.update_pool(pool).await?;
                tracing::info!(
                    "The pool {} scheduled to builder {:?} and agent {:?}",
                    pool_uuid,
                    builder,
                    agent
                );
            }
        }
        Ok(())
    }

    /// Bind unscheduled nodes to pre-existing idle machines. Hardware
    /// nodes have no other option; virtual nodes fall through to the
    /// pool path when nothing idle fits.
    async fn schedule_on_existing_machines(&self) -> Result<Vec<NodeBundle>, SvcError> {
        let unscheduled = self.unscheduled_nodes().await?;
        let idle = self.idle_machines().await;
        let mut idle_hws: Vec<MachineBundle> = idle
            .iter()
            .filter(|m| m.machine.machine_type == NodeType::Hw)
            .cloned()
            .collect();
        let mut idle_vms: Vec<MachineBundle> = idle
            .iter()
            .filter(|m| m.machine.machine_type == NodeType::Vm)
            .cloned()
            .collect();
        let mut vms = vec![];

        for bundle in unscheduled {
            let candidates = match bundle.node.node_type {
                NodeType::Hw => idle_hws.clone(),
                NodeType::Vm => idle_vms.clone(),
            };
            let mut candidates = candidates;
            for filter in &self.machine_filters {
                candidates = filter.filter(&bundle, candidates);
            }

            if candidates.is_empty() {
                match bundle.node.node_type {
                    NodeType::Hw => {
                        tracing::warn!(
                            "No HW machines found to schedule node {}",
                            bundle.node.uuid
                        );
                        if bundle.node.status != NodeStatus::Error {
                            let mut node = bundle.node;
                            node.status = NodeStatus::Error;
                            node.description = "No suitable HW machines found".into();
                            self.store.update_node(node).await?;
                        }
                    }
                    NodeType::Vm => {
                        tracing::debug!(
                            "No idle VM machines found to schedule node {}",
                            bundle.node.uuid
                        );
                        vms.push(bundle);
                    }
                }
                continue;
            }

            let mut weights = vec![0.0; candidates.len()];
            for weighter in &self.machine_weighters {
                for (accumulated, weight) in
                    weights.iter_mut().zip(weighter.weight(&candidates))
                {
                    *accumulated += weight;
                }
            }
            let index = match best_index(&weights) {
                Some(index) => index,
                None => continue,
            };
            let chosen = candidates[index].clone();

            let mut machine = chosen.machine.clone();
            machine.node = Some(bundle.node.uuid);
            machine.status = MachineStatus::Scheduled;
            let mut node = bundle.node.clone();
            node.status = NodeStatus::Scheduled;
            self.store.update_node(node).await?;
            self.store.update_machine(machine).await?;
            tracing::info!(
                "The node {} scheduled to {} machine",
                bundle.node.uuid,
                chosen.machine.uuid
            );

            match bundle.node.node_type {
                NodeType::Hw => idle_hws.retain(|m| m.machine.uuid != chosen.machine.uuid),
                NodeType::Vm => idle_vms.retain(|m| m.machine.uuid != chosen.machine.uuid),
            }
        }
        Ok(vms)
    }

    /// Build a fresh pool volume for a user volume
    fn build_machine_volume(pool: &mut PoolBundle, volume: &Volume) -> MachineVolume {
        if let Some(storage) = pool.pool.storage_pools.first_mut() {
            storage.allocate_capacity(volume.size);
        }
        let mut pool_volume = MachineVolume::default();
        pool_volume.uuid = volume.uuid;
        pool_volume.name = volume.uuid.to_string();
        pool_volume.index = volume.index;
        pool_volume.size = volume.size;
        pool_volume.image = volume.image.clone();
        pool_volume.boot = volume.boot;
        pool_volume.label = volume.label.clone();
        pool_volume.device_type = volume.device_type;
        pool_volume.node_volume = Some(volume.uuid);
        pool_volume.project_id = volume.project_id;
        pool_volume
    }

    /// Place a user volume into a pool, preferring a pre-existing pool
    /// volume of the same image that can be grown into shape
    fn place_volume_into_pool(pool: &mut PoolBundle, volume: &Volume) -> MachineVolume {
        if volume.image.is_none() {
            return Self::build_machine_volume(pool, volume);
        }

        let mut candidates: Vec<MachineVolume> = pool
            .volumes
            .iter()
            .filter(|pv| pv.image == volume.image && pv.size <= volume.size)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Self::build_machine_volume(pool, volume);
        }

        // The closest size needs the least growing
        candidates.sort_by_key(|pv| volume.size - pv.size);
        let mut pool_volume = candidates.remove(0);
        let need_size = volume.size - pool_volume.size;

        let storage_fits = pool
            .pool
            .storage_pools
            .first()
            .map(|s| s.has_capacity(need_size))
            .unwrap_or(false);
        if need_size > 0 && !storage_fits {
            return Self::build_machine_volume(pool, volume);
        }

        if let Some(storage) = pool.pool.storage_pools.first_mut() {
            storage.allocate_capacity(need_size);
        }
        pool.volumes.retain(|pv| pv.uuid != pool_volume.uuid);
        tracing::debug!(
            "Found machine volume {} for node volume {}",
            pool_volume.uuid,
            volume.uuid
        );
        pool_volume.node_volume = Some(volume.uuid);
        pool_volume.size = volume.size;
        pool_volume.index = volume.index;
        pool_volume.status = VolumeStatus::InProgress;
        pool_volume
    }

    /// Place a node into the chosen pool: materialise the machine and
    /// its volumes and debit the pool within the iteration so subsequent
    /// nodes see the update
    async fn place_node_into_pool(
        &self,
        bundle: &NodeBundle,
        pool: &mut PoolBundle,
    ) -> Result<(), SvcError> {
        let mut volumes = bundle.volumes.clone();
        if volumes.is_empty() {
            // The user api normally materialises the disk spec; cover
            // intent written directly to the store as well
            for volume in bundle.node.disk_spec.volumes(&bundle.node) {
                volumes.push(self.store.save_volume(volume).await?);
            }
        }

        let machine_uuid = bundle.node.uuid;
        let mut machine = Machine::default();
        machine.uuid = machine_uuid;
        machine.firmware_uuid = Some(machine_uuid);
        machine.name = bundle.node.name.clone();
        machine.cores = bundle.node.cores;
        machine.ram = bundle.node.ram;
        machine.node = Some(bundle.node.uuid);
        machine.project_id = bundle.node.project_id;
        machine.machine_type = NodeType::Vm;
        machine.status = MachineStatus::Scheduled;
        machine.pool = Some(pool.pool.uuid);

        let mut allocations = vec![];
        for volume in &volumes {
            allocations.push(Self::place_volume_into_pool(pool, volume));
        }

        let mut node = bundle.node.clone();
        node.pool = Some(pool.pool.uuid);
        node.status = NodeStatus::Scheduled;
        self.store.update_node(node).await?;
        self.store.save_machine(machine).await?;
        for mut pool_volume in allocations {
            pool_volume.pool = Some(pool.pool.uuid);
            pool_volume.machine = Some(machine_uuid);
            self.store.save_machine_volume(pool_volume).await?;
        }
        for mut volume in volumes {
            volume.pool = Some(pool.pool.uuid);
            self.store.update_volume(volume).await?;
        }

        tracing::info!(
            "The machine {} scheduled to {} pool",
            machine_uuid,
            pool.pool.uuid
        );

        // Actualize the pool after scheduling the machine to it
        pool.pool.avail_cores -= bundle.node.cores as i64;
        pool.pool.avail_ram -= bundle.node.ram as i64;
        self.store.update_pool(pool.pool.clone()).await?;
        Ok(())
    }

    /// Place the remaining virtual nodes through filters and weights
    async fn schedule_on_pools(
        &self,
        nodes: Vec<NodeBundle>,
        pools: &mut Vec<PoolBundle>,
    ) -> Result<(), SvcError> {
        if nodes.is_empty() {
            tracing::debug!("Nothing to schedule, no unscheduled nodes");
            return Ok(());
        }
        if pools.is_empty() {
            let nodes: Vec<Uuid> = nodes.iter().map(|n| n.node.uuid).collect();
            tracing::warn!("No pools found to schedule nodes {:?}", nodes);
            return Ok(());
        }

        for bundle in nodes {
            let mut candidates = pools.clone();
            for filter in &self.pool_filters {
                candidates = filter.filter(&self.store, &bundle, candidates).await?;
            }
            if candidates.is_empty() {
                tracing::warn!("No pools found to schedule node {}", bundle.node.uuid);
                continue;
            }

            let mut weights = vec![0.0; candidates.len()];
            for weighter in &self.pool_weighters {
                for (accumulated, weight) in
                    weights.iter_mut().zip(weighter.weight(&candidates))
                {
                    *accumulated += weight;
                }
            }
            let index = match best_index(&weights) {
                Some(index) => index,
                None => continue,
            };
            let mut chosen = candidates.remove(index);

            if let Err(error) = self.place_node_into_pool(&bundle, &mut chosen).await {
                tracing::error!(
                    "Error placing node {} into pool {}: {}",
                    bundle.node.uuid,
                    chosen.pool.uuid,
                    error
                );
                continue;
            }
            // Fold the debited pool back for the next node in this turn
            if let Some(existing) = pools.iter_mut().find(|p| p.pool.uuid == chosen.pool.uuid) {
                *existing = chosen;
            }
        }
        Ok(())
    }

    /// Co-locate volumes whose node is already placed onto its pool
    async fn schedule_volumes_on_pools(
        &self,
        pools: &mut Vec<PoolBundle>,
    ) -> Result<(), SvcError> {
        let volumes = self.store.list_volumes().await;
        let unscheduled: Vec<Volume> = volumes
            .into_iter()
            .filter(|v| v.pool.is_none() && v.node.is_some())
            .collect();
        if unscheduled.is_empty() {
            tracing::debug!("Nothing to schedule, no unscheduled volumes");
            return Ok(());
        }

        let machines = self.store.list_machines().await;
        for volume in unscheduled {
            let node = match volume.node {
                Some(node) => node,
                None => continue,
            };
            let machine = match machines.iter().find(|m| m.node == Some(node)) {
                Some(machine) => machine,
                None => {
                    tracing::debug!(
                        "Volume {} is assigned to an unplaced node {}, skipping",
                        volume.uuid,
                        node
                    );
                    continue;
                }
            };
            let pool_uuid = match machine.pool {
                Some(pool) => pool,
                None => continue,
            };
            let pool = match pools.iter_mut().find(|p| p.pool.uuid == pool_uuid) {
                Some(pool) => pool,
                None => {
                    tracing::error!(
                        "Unable to find pool for volume {} assigned to node {}",
                        volume.uuid,
                        node
                    );
                    continue;
                }
            };

            let mut pool_volume = Self::place_volume_into_pool(pool, &volume);
            pool_volume.pool = Some(pool_uuid);
            self.store.save_machine_volume(pool_volume).await?;
            let mut volume = volume;
            volume.pool = Some(pool_uuid);
            self.store.update_volume(volume).await?;
        }
        Ok(())
    }

    /// Hand machines that re-entered the build phase to a builder
    async fn schedule_in_update(&self, builders: &[Builder]) -> Result<(), SvcError> {
        let machines = self.store.list_machines().await;
        for machine in machines {
            if machine.pool.is_none()
                || machine.builder.is_some()
                || machine.build_status != MachineBuildStatus::InBuild
            {
                continue;
            }
            if let Some(builder) = choose(builders) {
                let mut machine = machine;
                machine.builder = Some(builder.uuid);
                let (machine_uuid, builder_uuid) = (machine.uuid, builder.uuid);
                self.store.update_machine(machine).await?;
                tracing::debug!(
                    "The machine {} scheduled to builder {}",
                    machine_uuid,
                    builder_uuid
                );
            }
        }
        Ok(())
    }

    /// Drop all builder registrations at the rebalance point. Live
    /// builders re-register on their next iteration; machines held by a
    /// dead builder get a new one through `schedule_in_update`.
    async fn rebalance_builders(&self, builders: &[Builder]) -> Result<(), SvcError> {
        let iteration = self.iteration_count.load(Ordering::Relaxed);
        if iteration == 0 || iteration % BUILDER_REBALANCE_RATE != 0 {
            return Ok(());
        }
        for builder in builders {
            self.store.delete_builder(&builder.uuid).await;
            tracing::debug!("The builder {} has been deleted for rebalancing", builder.uuid);
        }
        // Machines pointing at evicted builders go back into rotation
        for machine in self.store.list_machines().await {
            if let Some(builder) = machine.builder {
                if builders.iter().any(|b| b.uuid == builder) {
                    let mut machine = machine;
                    machine.builder = None;
                    self.store.update_machine(machine).await?;
                }
            }
        }
        Ok(())
    }

    /// One full scheduling turn
    pub async fn run_iteration(&self) -> Result<(), SvcError> {
        self.iteration_count.fetch_add(1, Ordering::Relaxed);
        let builders = self.active_builders().await;
        let pool_builders = Self::with_prefix(&builders, crate::POOL_BUILDER_PREFIX);
        let machine_builders = Self::with_prefix(&builders, crate::MACHINE_BUILDER_PREFIX);
        let mut pools = self.pool_bundles().await;

        if let Err(error) = self.schedule_pools(&pool_builders).await {
            tracing::error!("Error scheduling pools: {}", error);
        }

        let unscheduled_nodes = match self.schedule_on_existing_machines().await {
            Ok(nodes) => nodes,
            Err(error) => {
                tracing::error!("Error scheduling nodes: {}", error);
                vec![]
            }
        };

        if let Err(error) = self.schedule_on_pools(unscheduled_nodes, &mut pools).await {
            tracing::error!("Error scheduling nodes: {}", error);
        }

        if let Err(error) = self.schedule_volumes_on_pools(&mut pools).await {
            tracing::error!("Error scheduling volumes: {}", error);
        }

        if let Err(error) = self.schedule_in_update(&machine_builders).await {
            tracing::error!("Error scheduling in-update machines: {}", error);
        }

        self.rebalance_builders(&builders).await
    }
}

#[async_trait]
impl IterationService for SchedulerService {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn iteration(&self) -> Result<(), SvcError> {
        self.run_iteration().await
    }
}
