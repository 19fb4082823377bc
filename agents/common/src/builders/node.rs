//! Node builder: keeps each node's machine and user volumes aligned
//! with the node's intent and inherits status from the backing machine.

use crate::{
    errors::{InvalidPayload, SvcError},
    reconciler::{InstanceBuilder, InstanceSpec},
};
use async_trait::async_trait;
use snafu::ResultExt;
use store_api::{v0::*, Store};
use uuid::Uuid;

const KINDS: [ResourceKind; 1] = [ResourceKind::Node];

/// Node status inherited from a machine status
fn node_status_from(status: MachineStatus) -> NodeStatus {
    match status {
        MachineStatus::New => NodeStatus::New,
        MachineStatus::Scheduled => NodeStatus::Scheduled,
        MachineStatus::Started => NodeStatus::Started,
        MachineStatus::Active => NodeStatus::Active,
        MachineStatus::Error => NodeStatus::Error,
        _ => NodeStatus::InProgress,
    }
}

/// The node builder
#[derive(Debug, Default)]
pub struct NodeBuilder {}

impl NodeBuilder {
    /// New node builder
    pub fn new() -> Self {
        Self::default()
    }

    /// The machine backing a node, if it has been scheduled
    async fn machine_of(store: &Store, node: &Uuid) -> Option<Machine> {
        store
            .list_machines()
            .await
            .into_iter()
            .find(|m| m.node == Some(*node))
    }

    /// Align user volume rows with a changed disk spec. Returns whether
    /// the root volume changed, which forces a machine update.
    async fn update_volumes(
        store: &Store,
        node: &Node,
        old_spec: &DiskSpec,
    ) -> Result<bool, SvcError> {
        if *old_spec == node.disk_spec {
            return Ok(false);
        }

        let mut need_update_machine = false;
        let target_volumes = node.disk_spec.volumes(node);
        let actual_volumes = old_spec.volumes(node);

        for target in &target_volumes {
            match actual_volumes.iter().find(|v| v.uuid == target.uuid) {
                None => {
                    store.save_volume(target.clone()).await?;
                }
                Some(actual) => {
                    if target.size == actual.size
                        && target.image == actual.image
                        && target.label == actual.label
                        && target.device_type == actual.device_type
                        && target.boot == actual.boot
                    {
                        continue;
                    }
                    if target.index == ROOT_VOLUME_INDEX {
                        need_update_machine = true;
                    }
                    if let Some(mut volume) = store.find_volume(&target.uuid).await {
                        volume.size = target.size;
                        volume.image = target.image.clone();
                        volume.name = target.name.clone();
                        volume.boot = target.boot;
                        volume.device_type = target.device_type;
                        volume.label = target.label.clone();
                        volume.status = VolumeStatus::InProgress;
                        store.update_volume(volume).await?;
                    }
                }
            }
        }

        for actual in &actual_volumes {
            if !target_volumes.iter().any(|v| v.uuid == actual.uuid) {
                store.delete_volume(&actual.uuid).await;
            }
        }

        Ok(need_update_machine)
    }

    /// Push node shape changes down onto the backing machine
    async fn update_machine(store: &Store, node: &Node, force: bool) -> Result<(), SvcError> {
        let machine = match Self::machine_of(store, &node.uuid).await {
            Some(machine) => machine,
            // Perhaps it has not been scheduled yet
            None => {
                tracing::debug!("Machine for node {} not found", node.uuid);
                return Ok(());
            }
        };

        if !force
            && machine.cores == node.cores
            && machine.ram == node.ram
            && machine.name == node.name
        {
            return Ok(());
        }

        let mut machine = machine;
        machine.cores = node.cores;
        machine.ram = node.ram;
        machine.name = node.name.clone();
        machine.status = MachineStatus::InProgress;
        // Re-enter the build phase so a coordinator re-reserves capacity
        machine.build_status = MachineBuildStatus::InBuild;
        machine.builder = None;
        store.update_machine(machine).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceBuilder for NodeBuilder {
    type Context = ();

    fn name(&self) -> &str {
        "node-builder"
    }

    fn kinds(&self) -> &[ResourceKind] {
        &KINDS
    }

    async fn prepare_iteration(&self, _store: &Store) -> Result<Self::Context, SvcError> {
        Ok(())
    }

    async fn instances(
        &self,
        store: &Store,
        kind: ResourceKind,
        _ctx: &Self::Context,
    ) -> Result<Vec<InstanceSpec>, SvcError> {
        Ok(store
            .list_nodes()
            .await
            .into_iter()
            .map(|node| {
                let mut spec = InstanceSpec::new(kind, node.uuid, node.target_payload());
                spec.readiness = vec![ResourceId::new(ResourceKind::Machine, node.uuid)];
                spec.tracked = vec![ResourceId::new(ResourceKind::Machine, node.uuid)];
                spec
            })
            .collect())
    }

    async fn pre_update(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        target: &TargetResource,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        let node = match store.find_node(&instance.uuid).await {
            Some(node) => node,
            None => return Ok(()),
        };
        let old_spec: DiskSpec = target
            .payload
            .get("disk_spec")
            .cloned()
            .map(serde_json::from_value)
            .unwrap_or_else(|| Ok(DiskSpec::default()))
            .context(InvalidPayload {
                kind: instance.kind.to_string(),
                uuid: instance.uuid,
            })?;
        let old_hostname = target
            .payload
            .get("hostname")
            .and_then(|h| h.as_str())
            .map(str::to_string);

        let mut force = Self::update_volumes(store, &node, &old_spec).await?;
        // The hostname lives in the guest derivative only, so a change
        // must rebuild the machine resource to reach it
        if node.hostname != old_hostname {
            force = true;
        }
        Self::update_machine(store, &node, force).await
    }

    async fn actualize_with_outdated_tracked(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        let node = match store.find_node(&instance.uuid).await {
            Some(node) => node,
            None => return Ok(()),
        };
        let machine = match Self::machine_of(store, &node.uuid).await {
            Some(machine) => machine,
            None => return Ok(()),
        };

        let mut updated = node.clone();
        updated.status = node_status_from(machine.status);

        // Surface the primary port once the network driver activated it
        let port = store
            .list_ports()
            .await
            .into_iter()
            .find(|p| p.node == Some(node.uuid) && p.status == PortStatus::Active);
        if let Some(port) = port {
            updated.default_network = Some(port.info());
        }

        if updated.status != node.status || updated.default_network != node.default_network {
            store.update_node(updated).await?;
        }
        Ok(())
    }

    async fn pre_delete(&self, store: &Store, target: &TargetResource) -> Result<(), SvcError> {
        // Machines go back to the idle pool when they are hardware and
        // away entirely when they were built for this node
        for machine in store.list_machines().await {
            if machine.node != Some(target.uuid) {
                continue;
            }
            match machine.machine_type {
                NodeType::Hw => {
                    let mut machine = machine;
                    machine.node = None;
                    machine.status = MachineStatus::Idle;
                    store.update_machine(machine).await?;
                }
                NodeType::Vm => {
                    store.delete_machine(&machine.uuid).await;
                }
            }
        }
        for volume in store.list_volumes().await {
            if volume.node == Some(target.uuid) {
                store.delete_volume(&volume.uuid).await;
            }
        }
        for allocation in store.list_policy_allocations().await {
            if allocation.node == target.uuid {
                store.delete_policy_allocation(&allocation.uuid).await;
            }
        }
        Ok(())
    }
}
