//! Pluggable scheduling filters.

use super::{MachineBundle, NodeBundle, PoolBundle};
use crate::errors::SvcError;
use async_trait::async_trait;
use std::collections::HashSet;
use store_api::Store;
use uuid::Uuid;

/// Filters out pools that are not suitable for a node
#[async_trait]
pub trait PoolFilter: Send + Sync {
    /// Return the pools the node may be placed on
    async fn filter(
        &self,
        store: &Store,
        node: &NodeBundle,
        pools: Vec<PoolBundle>,
    ) -> Result<Vec<PoolBundle>, SvcError>;
}

/// Filters out idle machines that are not suitable for a node
pub trait MachineFilter: Send + Sync {
    /// Return the machines the node may be bound to
    fn filter(&self, node: &NodeBundle, machines: Vec<MachineBundle>) -> Vec<MachineBundle>;
}

/// Keeps pools with enough free cores and ram for the node
#[derive(Debug, Default)]
pub struct CoresRamAvailableFilter {}

#[async_trait]
impl PoolFilter for CoresRamAvailableFilter {
    async fn filter(
        &self,
        _store: &Store,
        node: &NodeBundle,
        pools: Vec<PoolBundle>,
    ) -> Result<Vec<PoolBundle>, SvcError> {
        let node = &node.node;
        Ok(pools
            .into_iter()
            .filter(|p| {
                p.pool.avail_cores >= node.cores as i64 && p.pool.avail_ram >= node.ram as i64
            })
            .collect())
    }
}

/// Prefers pools not hosting other members of the node's placement
/// policies. Soft: when every pool is taken the whole set is returned,
/// co-location beats not scheduling at all.
#[derive(Debug, Default)]
pub struct SoftAntiAffinityFilter {}

#[async_trait]
impl PoolFilter for SoftAntiAffinityFilter {
    async fn filter(
        &self,
        store: &Store,
        node: &NodeBundle,
        pools: Vec<PoolBundle>,
    ) -> Result<Vec<PoolBundle>, SvcError> {
        let allocations = store.list_policy_allocations().await;
        let policies: HashSet<Uuid> = allocations
            .iter()
            .filter(|a| a.node == node.node.uuid)
            .map(|a| a.policy)
            .collect();
        // No policies, no constraints
        if policies.is_empty() {
            return Ok(pools);
        }

        let peers: HashSet<Uuid> = allocations
            .iter()
            .filter(|a| policies.contains(&a.policy) && a.node != node.node.uuid)
            .map(|a| a.node)
            .collect();

        let taken: HashSet<Uuid> = store
            .list_machines()
            .await
            .into_iter()
            .filter(|m| m.node.map(|n| peers.contains(&n)).unwrap_or(false))
            .filter_map(|m| m.pool)
            .collect();

        let avail: Vec<PoolBundle> = pools
            .iter()
            .filter(|p| !taken.contains(&p.pool.uuid))
            .cloned()
            .collect();

        // Soft anti-affinity allows any pool when no free pool remains
        if avail.is_empty() {
            return Ok(pools);
        }
        Ok(avail)
    }
}

/// Keeps idle hardware machines big enough for the node
#[derive(Debug, Default)]
pub struct HwCoresRamAvailableFilter {}

impl MachineFilter for HwCoresRamAvailableFilter {
    fn filter(&self, node: &NodeBundle, machines: Vec<MachineBundle>) -> Vec<MachineBundle> {
        let node = &node.node;
        machines
            .into_iter()
            .filter(|m| m.machine.cores >= node.cores && m.machine.ram >= node.ram)
            .collect()
    }
}
