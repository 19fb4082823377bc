//! Load-balancer builder: a load-balanced group is one node set under
//! the hood; member addresses and status flow back into the balancer.

use crate::{
    errors::SvcError,
    reconciler::{InstanceBuilder, InstanceSpec},
};
use async_trait::async_trait;
use store_api::{v0::*, Store};

const KINDS: [ResourceKind; 1] = [ResourceKind::LoadBalancer];
const NAME_PREFIX: &str = "lbaas";

/// The load-balancer builder
#[derive(Debug, Default)]
pub struct LbBuilder {}

impl LbBuilder {
    /// New load-balancer builder
    pub fn new() -> Self {
        Self::default()
    }

    fn node_set_for(lb: &LoadBalancer) -> NodeSet {
        let mut set = NodeSet::default();
        set.uuid = lb.uuid;
        set.project_id = lb.project_id;
        set.name = format!("{}-{}", NAME_PREFIX, lb.name);
        set.cores = lb.lb_type.cpu;
        set.ram = lb.lb_type.ram;
        set.root_disk_size = lb.lb_type.disk_size;
        set.image = lb.image.clone();
        set.replicas = lb.lb_type.nodes_number;
        set
    }
}

#[async_trait]
impl InstanceBuilder for LbBuilder {
    type Context = ();

    fn name(&self) -> &str {
        "lb-builder"
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
            .list_load_balancers()
            .await
            .into_iter()
            .map(|lb| {
                let mut spec = InstanceSpec::new(kind, lb.uuid, lb.target_payload());
                spec.tracked = vec![ResourceId::new(ResourceKind::NodeSet, lb.uuid)];
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
        if let Some(lb) = store.find_load_balancer(&instance.uuid).await {
            store.save_node_set(Self::node_set_for(&lb)).await?;
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
        let lb = match store.find_load_balancer(&instance.uuid).await {
            Some(lb) => lb,
            None => return Ok(()),
        };
        let set = match store.find_node_set(&lb.uuid).await {
            Some(set) => set,
            None => {
                store.save_node_set(Self::node_set_for(&lb)).await?;
                return Ok(());
            }
        };
        let mut set = set;
        set.cores = lb.lb_type.cpu;
        set.ram = lb.lb_type.ram;
        set.replicas = lb.lb_type.nodes_number;
        // Resizing the root disk wipes it, leave it alone until
        // persistent member volumes exist
        store.update_node_set(set).await?;
        Ok(())
    }

    async fn actualize_with_outdated_tracked(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        let lb = match store.find_load_balancer(&instance.uuid).await {
            Some(lb) => lb,
            None => return Ok(()),
        };
        let set = match store.find_node_set(&lb.uuid).await {
            Some(set) => set,
            None => return Ok(()),
        };

        let mut ips: Vec<_> = set.nodes.values().filter_map(|m| m.ipv4).collect();
        ips.sort();

        if lb.ipsv4 != ips || lb.status != set.status {
            let mut lb = lb;
            lb.ipsv4 = ips;
            lb.status = set.status;
            store.update_load_balancer(lb).await?;
        }
        Ok(())
    }

    async fn pre_delete(&self, store: &Store, target: &TargetResource) -> Result<(), SvcError> {
        store.delete_node_set(&target.uuid).await;
        Ok(())
    }
}
