//! Pluggable scheduling weighters.

use super::{MachineBundle, PoolBundle};
use store_api::v0::MachinePool;

/// Assigns a weight to each candidate pool; the scheduler sums the
/// outputs of all weighters and picks the highest total
pub trait PoolWeighter: Send + Sync {
    /// Weights in the same order as `pools`, each in `[0, 1]`
    fn weight(&self, pools: &[PoolBundle]) -> Vec<f64>;
}

/// Assigns a weight to each candidate idle machine
pub trait MachineWeighter: Send + Sync {
    /// Weights in the same order as `machines`
    fn weight(&self, machines: &[MachineBundle]) -> Vec<f64>;
}

/// Rewards pools with balanced utilisation: the emptier a pool is
/// relative to the others, the higher its weight
#[derive(Debug, Default)]
pub struct RelativeCoreRamWeighter {}

impl RelativeCoreRamWeighter {
    const ALMOST_OVERUSED_THRESHOLD: f64 = 0.8;

    /// Empirical usage ratio of the pool in `[0, 1]`
    fn usage_ratio(pool: &MachinePool) -> f64 {
        // The pool is overused
        if pool.avail_cores < 0 || pool.avail_ram < 0 {
            return 1.0;
        }

        // Unable to calculate a ratio, consider the pool overused
        if pool.all_cores == 0 || pool.all_ram == 0 {
            return 1.0;
        }

        let ratios = [
            (pool.all_cores - pool.avail_cores) as f64 / pool.all_cores as f64,
            (pool.all_ram - pool.avail_ram) as f64 / pool.all_ram as f64,
        ];

        // A lopsided pool is judged by its worst dimension
        if ratios.iter().any(|r| *r > Self::ALMOST_OVERUSED_THRESHOLD) {
            return ratios.iter().cloned().fold(0.0, f64::max);
        }

        ratios.iter().sum::<f64>() / ratios.len() as f64
    }
}

impl PoolWeighter for RelativeCoreRamWeighter {
    fn weight(&self, pools: &[PoolBundle]) -> Vec<f64> {
        let usages: Vec<f64> = pools.iter().map(|p| Self::usage_ratio(&p.pool)).collect();
        let total: f64 = usages.iter().sum();

        // The system is empty, all pools weigh the same
        if total == 0.0 {
            return pools.iter().map(|_| 1.0 / pools.len() as f64).collect();
        }

        usages.iter().map(|u| 1.0 - u / total).collect()
    }
}

/// All idle machines weigh the same
#[derive(Debug, Default)]
pub struct UniformMachineWeighter {}

impl MachineWeighter for UniformMachineWeighter {
    fn weight(&self, machines: &[MachineBundle]) -> Vec<f64> {
        if machines.is_empty() {
            return vec![];
        }
        machines.iter().map(|_| 1.0 / machines.len() as f64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(all_cores: i64, avail_cores: i64, all_ram: i64, avail_ram: i64) -> PoolBundle {
        let mut pool = MachinePool::default();
        pool.all_cores = all_cores;
        pool.avail_cores = avail_cores;
        pool.all_ram = all_ram;
        pool.avail_ram = avail_ram;
        PoolBundle {
            pool,
            volumes: vec![],
        }
    }

    #[test]
    fn weight_empty_system() {
        let weighter = RelativeCoreRamWeighter::default();
        let pools = vec![pool(100, 100, 100_000, 100_000)];
        let weights = weighter.weight(&pools);
        assert_eq!(weights, vec![1.0]);
    }

    #[test]
    fn less_used_pools_weigh_more() {
        let weighter = RelativeCoreRamWeighter::default();
        let pools = vec![
            // 50% used
            pool(100, 50, 100_000, 50_000),
            // 20% used
            pool(100, 80, 100_000, 80_000),
            // fully used
            pool(100, 0, 100_000, 0),
        ];
        let weights = weighter.weight(&pools);
        assert_eq!(weights.len(), 3);
        assert!(weights[1] > weights[0]);
        assert!(weights[0] > weights[2]);
    }

    #[test]
    fn overused_pool_weighs_nothing() {
        let weighter = RelativeCoreRamWeighter::default();
        let pools = vec![pool(100, -10, 100_000, -5_000)];
        let weights = weighter.weight(&pools);
        assert_eq!(weights, vec![0.0]);
    }

    #[test]
    fn lopsided_pool_is_judged_by_worst_dimension() {
        let weighter = RelativeCoreRamWeighter::default();
        let pools = vec![
            // ram nearly exhausted, cores barely used
            pool(100, 90, 100_000, 10_000),
            // both dimensions at 50%
            pool(100, 50, 100_000, 50_000),
        ];
        let weights = weighter.weight(&pools);
        assert!(weights[1] > weights[0]);
    }
}
