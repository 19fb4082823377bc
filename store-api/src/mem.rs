//! In-memory store implementation.
//!
//! One `Store` handle is shared by every in-process service, mirroring
//! the row-level semantics the services rely on: insert conflicts on a
//! duplicate uuid, update requires the row to exist and bumps
//! `updated_at`, validation runs at write time so invalid intent never
//! reaches the scheduler.

use crate::{v0::*, StoreError, StoreRecord};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Cloneable handle to the shared control-plane state
#[derive(Clone, Debug, Default)]
pub struct Store {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    nodes: HashMap<Uuid, Node>,
    machines: HashMap<Uuid, Machine>,
    volumes: HashMap<Uuid, Volume>,
    machine_volumes: HashMap<Uuid, MachineVolume>,
    pools: HashMap<Uuid, MachinePool>,
    node_sets: HashMap<Uuid, NodeSet>,
    placement_policies: HashMap<Uuid, PlacementPolicy>,
    policy_allocations: HashMap<Uuid, PolicyAllocation>,
    reservations: HashMap<Uuid, MachinePoolReservation>,
    builders: HashMap<Uuid, Builder>,
    machine_agents: HashMap<Uuid, MachineAgent>,
    ports: HashMap<Uuid, Port>,
    interfaces: HashMap<Uuid, Interface>,
    core_agents: HashMap<Uuid, CoreAgent>,
    load_balancers: HashMap<Uuid, LoadBalancer>,
    target_resources: HashMap<(ResourceKind, Uuid), TargetResource>,
    resources: HashMap<(ResourceKind, Uuid), Resource>,
}

macro_rules! impl_record {
    ($model:ty, $kind:literal) => {
        impl StoreRecord for $model {
            fn uuid(&self) -> Uuid {
                self.uuid
            }
            fn touch(&mut self, now: DateTime<Utc>) {
                self.updated_at = now;
            }
        }
    };
}

impl_record!(Machine, "machine");
impl_record!(MachinePool, "pool");
impl_record!(PlacementPolicy, "placement policy");
impl_record!(MachinePoolReservation, "reservation");
impl_record!(Builder, "builder");
impl_record!(MachineAgent, "machine agent");
impl_record!(Port, "port");
impl_record!(LoadBalancer, "load balancer");

impl StoreRecord for PolicyAllocation {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl StoreRecord for Interface {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl StoreRecord for CoreAgent {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl StoreRecord for Node {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
    fn validate(&self) -> Result<(), StoreError> {
        if self.cores < 1 || self.cores > 4096 {
            return validation("node", format!("cores {} out of 1..4096", self.cores));
        }
        if self.ram < 1 {
            return validation("node", "ram must be at least 1 MiB".into());
        }
        if self.root_disk_size < 1 || self.root_disk_size > 1_000_000 {
            return validation(
                "node",
                format!("root disk size {} out of 1..1000000", self.root_disk_size),
            );
        }
        validate_disk_spec(&self.disk_spec)
    }
}

impl StoreRecord for Volume {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
    fn validate(&self) -> Result<(), StoreError> {
        validate_size("volume", self.size)
    }
}

impl StoreRecord for MachineVolume {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
    fn validate(&self) -> Result<(), StoreError> {
        validate_size("machine volume", self.size)
    }
}

impl StoreRecord for NodeSet {
    fn uuid(&self) -> Uuid {
        self.uuid
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
    fn validate(&self) -> Result<(), StoreError> {
        if self.cores < 1 || self.cores > 4096 {
            return validation("node set", format!("cores {} out of 1..4096", self.cores));
        }
        if self.ram < 1 {
            return validation("node set", "ram must be at least 1 MiB".into());
        }
        Ok(())
    }
}

fn validation(kind: &'static str, reason: String) -> Result<(), StoreError> {
    Err(StoreError::Validation { kind, reason })
}

fn validate_size(kind: &'static str, size: u64) -> Result<(), StoreError> {
    if size < 1 || size > 1_000_000 {
        return validation(kind, format!("size {} out of 1..1000000", size));
    }
    Ok(())
}

fn validate_disk_spec(spec: &DiskSpec) -> Result<(), StoreError> {
    let roots: Vec<_> = spec
        .volumes
        .iter()
        .filter(|e| e.index == ROOT_VOLUME_INDEX)
        .collect();
    if roots.len() > 1 {
        return validation("disk spec", "more than one root volume".into());
    }
    if let Some(root) = roots.first() {
        if !root.boot {
            return validation("disk spec", "root volume must be bootable".into());
        }
    }
    for entry in &spec.volumes {
        validate_size("disk spec entry", entry.size)?;
    }
    Ok(())
}

macro_rules! store_collection {
    ($singular:ident, $plural:ident, $model:ty, $kind:literal) => {
        paste::paste! {
            /// Get one record or fail with `NotFound`
            pub async fn [<get_ $singular>](&self, uuid: &Uuid) -> Result<$model, StoreError> {
                self.inner
                    .read()
                    .await
                    .$plural
                    .get(uuid)
                    .cloned()
                    .ok_or(StoreError::NotFound { kind: $kind, uuid: *uuid })
            }

            /// Get one record or `None`
            pub async fn [<find_ $singular>](&self, uuid: &Uuid) -> Option<$model> {
                self.inner.read().await.$plural.get(uuid).cloned()
            }

            /// All records of the collection, unspecified order
            pub async fn [<list_ $plural>](&self) -> Vec<$model> {
                self.inner.read().await.$plural.values().cloned().collect()
            }

            /// Insert a fresh record, conflicting on a duplicate uuid
            pub async fn [<insert_ $singular>](&self, record: $model) -> Result<$model, StoreError> {
                record.validate()?;
                let mut inner = self.inner.write().await;
                if inner.$plural.contains_key(&record.uuid()) {
                    return Err(StoreError::Conflict { kind: $kind, uuid: record.uuid() });
                }
                inner.$plural.insert(record.uuid(), record.clone());
                Ok(record)
            }

            /// Update an existing record, bumping its modification stamp
            pub async fn [<update_ $singular>](&self, mut record: $model) -> Result<$model, StoreError> {
                record.validate()?;
                let mut inner = self.inner.write().await;
                if !inner.$plural.contains_key(&record.uuid()) {
                    return Err(StoreError::NotFound { kind: $kind, uuid: record.uuid() });
                }
                record.touch(Utc::now());
                inner.$plural.insert(record.uuid(), record.clone());
                Ok(record)
            }

            /// Insert or update, bumping the stamp when the record existed
            pub async fn [<save_ $singular>](&self, mut record: $model) -> Result<$model, StoreError> {
                record.validate()?;
                let mut inner = self.inner.write().await;
                if inner.$plural.contains_key(&record.uuid()) {
                    record.touch(Utc::now());
                }
                inner.$plural.insert(record.uuid(), record.clone());
                Ok(record)
            }

            /// Delete a record if present
            pub async fn [<delete_ $singular>](&self, uuid: &Uuid) -> Option<$model> {
                self.inner.write().await.$plural.remove(uuid)
            }
        }
    };
}

impl Store {
    /// Fresh empty store
    pub fn new() -> Self {
        Self::default()
    }

    store_collection!(node, nodes, Node, "node");
    store_collection!(machine, machines, Machine, "machine");
    store_collection!(volume, volumes, Volume, "volume");
    store_collection!(machine_volume, machine_volumes, MachineVolume, "machine volume");
    store_collection!(pool, pools, MachinePool, "pool");
    store_collection!(node_set, node_sets, NodeSet, "node set");
    store_collection!(placement_policy, placement_policies, PlacementPolicy, "placement policy");
    store_collection!(policy_allocation, policy_allocations, PolicyAllocation, "policy allocation");
    store_collection!(reservation, reservations, MachinePoolReservation, "reservation");
    store_collection!(builder, builders, Builder, "builder");
    store_collection!(machine_agent, machine_agents, MachineAgent, "machine agent");
    store_collection!(port, ports, Port, "port");
    store_collection!(interface, interfaces, Interface, "interface");
    store_collection!(core_agent, core_agents, CoreAgent, "core agent");
    store_collection!(load_balancer, load_balancers, LoadBalancer, "load balancer");

    /// Get a target resource by kind and uuid
    pub async fn find_target_resource(
        &self,
        kind: ResourceKind,
        uuid: &Uuid,
    ) -> Option<TargetResource> {
        self.inner
            .read()
            .await
            .target_resources
            .get(&(kind, *uuid))
            .cloned()
    }

    /// All target resources of one kind
    pub async fn list_target_resources(&self, kind: ResourceKind) -> Vec<TargetResource> {
        self.inner
            .read()
            .await
            .target_resources
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// All target resources scheduled to `agent`, any kind
    pub async fn list_agent_target_resources(&self, agent: &Uuid) -> Vec<TargetResource> {
        self.inner
            .read()
            .await
            .target_resources
            .values()
            .filter(|r| r.agent.as_ref() == Some(agent))
            .cloned()
            .collect()
    }

    /// Insert or replace a target resource
    pub async fn save_target_resource(&self, mut resource: TargetResource) -> TargetResource {
        resource.updated_at = Utc::now();
        self.inner
            .write()
            .await
            .target_resources
            .insert((resource.kind, resource.uuid), resource.clone());
        resource
    }

    /// Delete a target resource if present
    pub async fn delete_target_resource(
        &self,
        kind: ResourceKind,
        uuid: &Uuid,
    ) -> Option<TargetResource> {
        self.inner
            .write()
            .await
            .target_resources
            .remove(&(kind, *uuid))
    }

    /// Get an actual resource by kind and uuid
    pub async fn find_resource(&self, kind: ResourceKind, uuid: &Uuid) -> Option<Resource> {
        self.inner.read().await.resources.get(&(kind, *uuid)).cloned()
    }

    /// All actual resources of one kind
    pub async fn list_resources(&self, kind: ResourceKind) -> Vec<Resource> {
        self.inner
            .read()
            .await
            .resources
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Insert or replace an actual resource. The observation timestamp is
    /// only bumped when the observed payload changed, so a steady state
    /// does not look like fresh news to the builders.
    pub async fn save_resource(&self, mut resource: Resource) -> Resource {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.resources.get(&(resource.kind, resource.uuid)) {
            if existing.hash == resource.hash {
                return existing.clone();
            }
        }
        resource.updated_at = Utc::now();
        inner
            .resources
            .insert((resource.kind, resource.uuid), resource.clone());
        resource
    }

    /// Delete an actual resource if present
    pub async fn delete_resource(&self, kind: ResourceKind, uuid: &Uuid) -> Option<Resource> {
        self.inner.write().await.resources.remove(&(kind, *uuid))
    }

    /// Newest modification stamp behind a resource identifier, `None` when
    /// nothing matching exists. Machines and pool volumes may be matched
    /// through their back-references since reused records keep their own
    /// uuids.
    pub async fn tracked_updated_at(&self, ri: &ResourceId) -> Option<DateTime<Utc>> {
        let inner = self.inner.read().await;
        match ri.kind {
            ResourceKind::Machine => inner
                .machines
                .values()
                .filter(|m| m.uuid == ri.uuid || m.node == Some(ri.uuid))
                .map(|m| m.updated_at)
                .max(),
            ResourceKind::PoolVolume => inner
                .machine_volumes
                .values()
                .filter(|v| v.uuid == ri.uuid || v.node_volume == Some(ri.uuid))
                .map(|v| v.updated_at)
                .max(),
            ResourceKind::Node => inner.nodes.get(&ri.uuid).map(|n| n.updated_at),
            ResourceKind::Volume => inner.volumes.get(&ri.uuid).map(|v| v.updated_at),
            ResourceKind::NodeSet => inner.node_sets.get(&ri.uuid).map(|s| s.updated_at),
            ResourceKind::Pool => inner.pools.get(&ri.uuid).map(|p| p.updated_at),
            ResourceKind::LoadBalancer => {
                inner.load_balancers.get(&ri.uuid).map(|l| l.updated_at)
            }
            ResourceKind::PoolMachine | ResourceKind::GuestMachine => inner
                .resources
                .get(&(ri.kind, ri.uuid))
                .map(|r| r.updated_at),
        }
    }

    /// Whether anything exists behind a resource identifier
    pub async fn ri_exists(&self, ri: &ResourceId) -> bool {
        self.tracked_updated_at(ri).await.is_some()
    }
}
