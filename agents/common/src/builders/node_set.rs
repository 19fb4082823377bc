//! Node-set builder: materialises the replica nodes of a set with
//! deterministic identities, keeps the set's default soft-anti-affinity
//! policy, and aggregates the children's status.

use crate::{
    errors::SvcError,
    reconciler::{InstanceBuilder, InstanceSpec},
};
use async_trait::async_trait;
use std::collections::HashMap;
use store_api::{v0::*, Store};

const KINDS: [ResourceKind; 1] = [ResourceKind::NodeSet];

/// The node-set builder
#[derive(Debug, Default)]
pub struct NodeSetBuilder {}

impl NodeSetBuilder {
    /// New node-set builder
    pub fn new() -> Self {
        Self::default()
    }

    /// The set's default placement policy, created on first use
    async fn get_or_create_policy(
        store: &Store,
        set: &NodeSet,
    ) -> Result<PlacementPolicy, SvcError> {
        let policy_uuid = set.policy_uuid();
        if let Some(policy) = store.find_placement_policy(&policy_uuid).await {
            return Ok(policy);
        }
        let mut policy = PlacementPolicy::default();
        policy.uuid = policy_uuid;
        policy.name = "soft-anti-affinity".into();
        policy.description = format!("Soft anti-affinity placement policy for node set {}", set.uuid);
        policy.kind = PlacementPolicyKind::SoftAntiAffinity;
        policy.project_id = set.project_id;
        Ok(store.save_placement_policy(policy).await?)
    }

    /// Converge the child node rows onto the replica count: growth
    /// appends, shrink trims the tail, existing children keep their
    /// identity and receive shape updates only
    async fn actualize_children(store: &Store, set: &NodeSet) -> Result<(), SvcError> {
        let policy = Self::get_or_create_policy(store, set).await?;
        let targets = set.gen_nodes(&[policy.uuid]);
        let wanted: Vec<_> = targets.iter().map(|n| n.uuid).collect();

        for target in targets {
            match store.find_node(&target.uuid).await {
                None => {
                    let allocation = PolicyAllocation::new(target.uuid, policy.uuid);
                    store.save_node(target).await?;
                    store.save_policy_allocation(allocation).await?;
                }
                Some(mut node) => {
                    if node.cores == target.cores
                        && node.ram == target.ram
                        && node.image == target.image
                        && node.disk_spec == target.disk_spec
                    {
                        continue;
                    }
                    node.cores = target.cores;
                    node.ram = target.ram;
                    node.image = target.image.clone();
                    node.disk_spec = target.disk_spec.clone();
                    store.update_node(node).await?;
                }
            }
        }

        // Children past the new replica count are shed, never renumbered
        for node in store.list_nodes().await {
            if node.node_set == Some(set.uuid) && !wanted.contains(&node.uuid) {
                store.delete_node(&node.uuid).await;
            }
        }
        Ok(())
    }

    /// Aggregated set status from the children's statuses
    fn aggregate_status(set: &NodeSet, statuses: &[NodeStatus]) -> NodeStatus {
        if statuses.len() >= set.replicas as usize
            && statuses.iter().all(|s| *s == NodeStatus::Active)
        {
            NodeStatus::Active
        } else if statuses.iter().any(|s| *s == NodeStatus::Error) {
            NodeStatus::Error
        } else if statuses.iter().any(|s| *s == NodeStatus::New) {
            NodeStatus::New
        } else if statuses.iter().any(|s| *s == NodeStatus::InProgress) {
            NodeStatus::InProgress
        } else {
            set.status
        }
    }
}

#[async_trait]
impl InstanceBuilder for NodeSetBuilder {
    type Context = ();

    fn name(&self) -> &str {
        "node-set-builder"
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
            .list_node_sets()
            .await
            .into_iter()
            .map(|set| {
                let mut spec = InstanceSpec::new(kind, set.uuid, set.target_payload());
                spec.tracked = set
                    .node_uuids()
                    .into_iter()
                    .map(|uuid| ResourceId::new(ResourceKind::Node, uuid))
                    .collect();
                spec
            })
            .collect())
    }

    async fn post_create(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        if let Some(set) = store.find_node_set(&instance.uuid).await {
            Self::actualize_children(store, &set).await?;
        }
        Ok(())
    }

    async fn pre_update(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        _target: &TargetResource,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        if let Some(set) = store.find_node_set(&instance.uuid).await {
            Self::actualize_children(store, &set).await?;
        }
        Ok(())
    }

    async fn actualize_with_outdated_tracked(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        let set = match store.find_node_set(&instance.uuid).await {
            Some(set) => set,
            None => return Ok(()),
        };
        let wanted = set.node_uuids();

        let mut members = HashMap::new();
        let mut statuses = vec![];
        for node in store.list_nodes().await {
            if node.node_set != Some(set.uuid) {
                continue;
            }
            // Children on their way out of a shrink do not count
            if !wanted.contains(&node.uuid) {
                continue;
            }
            members.insert(
                node.uuid,
                NodeSetMember {
                    ipv4: node.default_network.as_ref().and_then(|n| n.ipv4),
                },
            );
            statuses.push(node.status);
        }

        let status = Self::aggregate_status(&set, &statuses);
        if status != set.status || members != set.nodes {
            let mut set = set;
            set.status = status;
            set.nodes = members;
            store.update_node_set(set).await?;
        }
        Ok(())
    }

    async fn pre_delete(&self, store: &Store, target: &TargetResource) -> Result<(), SvcError> {
        for node in store.list_nodes().await {
            if node.node_set == Some(target.uuid) {
                store.delete_node(&node.uuid).await;
            }
        }
        let policy_uuid = uuid5(&target.uuid, "soft-anti-affinity");
        for allocation in store.list_policy_allocations().await {
            if allocation.policy == policy_uuid {
                store.delete_policy_allocation(&allocation.uuid).await;
            }
        }
        store.delete_placement_policy(&policy_uuid).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_with_replicas(replicas: u32) -> NodeSet {
        let mut set = NodeSet::default();
        set.replicas = replicas;
        set.status = NodeStatus::InProgress;
        set
    }

    #[test]
    fn all_active_children_make_the_set_active() {
        let set = set_with_replicas(2);
        let status = NodeSetBuilder::aggregate_status(
            &set,
            &[NodeStatus::Active, NodeStatus::Active],
        );
        assert_eq!(status, NodeStatus::Active);
    }

    #[test]
    fn missing_children_keep_the_set_pending() {
        let set = set_with_replicas(3);
        let status = NodeSetBuilder::aggregate_status(
            &set,
            &[NodeStatus::Active, NodeStatus::Active],
        );
        assert_eq!(status, NodeStatus::InProgress);
    }

    #[test]
    fn an_errored_child_dominates() {
        let set = set_with_replicas(2);
        let status = NodeSetBuilder::aggregate_status(
            &set,
            &[NodeStatus::Active, NodeStatus::Error],
        );
        assert_eq!(status, NodeStatus::Error);
    }

    #[test]
    fn quiet_children_leave_the_status_alone() {
        let set = set_with_replicas(2);
        let status = NodeSetBuilder::aggregate_status(
            &set,
            &[NodeStatus::Scheduled, NodeStatus::Started],
        );
        assert_eq!(status, set.status);
    }
}
