//! Placement behaviour of the scheduler against the in-memory store.

use common::{scheduler::SchedulerService, IterationService};
use store_api::{v0::*, Store};
use uuid::Uuid;

fn active_pool(all_cores: i64, all_ram: i64) -> MachinePool {
    let mut pool = MachinePool::default();
    pool.status = MachinePoolStatus::Active;
    pool.machine_type = NodeType::Vm;
    pool.builder = Some(Uuid::new_v4());
    pool.agent = Some(Uuid::new_v4());
    pool.driver_spec = serde_json::json!({ "driver": "dummy" });
    pool.all_cores = all_cores;
    pool.all_ram = all_ram;
    pool.avail_cores = all_cores;
    pool.avail_ram = all_ram;
    pool.storage_pools = vec![ThinStoragePool {
        capacity_usable: 1000,
        available_actual: 1000.0,
        pool_type: StoragePoolType::Dir,
        oversubscription_ratio: StoragePoolType::Dir.oversubscription_ratio(),
        ..Default::default()
    }];
    pool
}

fn vm_node(cores: u32, ram: u64, root_disk_size: u64) -> Node {
    let mut node = Node::default();
    node.name = "test-node".into();
    node.cores = cores;
    node.ram = ram;
    node.root_disk_size = root_disk_size;
    node.image = "ubuntu_24.04".into();
    node.disk_spec = DiskSpec::root(root_disk_size, Some(node.image.clone()));
    node
}

#[tokio::test]
async fn fresh_vm_lands_on_the_only_pool() {
    let store = Store::new();
    let pool = store.insert_pool(active_pool(8, 16384)).await.unwrap();
    let node = store.insert_node(vm_node(2, 4096, 10)).await.unwrap();

    let scheduler = SchedulerService::with_defaults(store.clone());
    scheduler.iteration().await.unwrap();

    let machine = store.get_machine(&node.uuid).await.unwrap();
    assert_eq!(machine.pool, Some(pool.uuid));
    assert_eq!(machine.node, Some(node.uuid));
    assert_eq!(machine.status, MachineStatus::Scheduled);

    let volumes = store.list_machine_volumes().await;
    assert_eq!(volumes.len(), 1);
    let root = &volumes[0];
    assert_eq!(root.index, 0);
    assert_eq!(root.size, 10);
    assert_eq!(root.pool, Some(pool.uuid));
    assert_eq!(root.machine, Some(machine.uuid));

    let pool = store.get_pool(&pool.uuid).await.unwrap();
    assert_eq!(pool.avail_cores, 6);
    assert_eq!(pool.avail_ram, 12288);

    let node = store.get_node(&node.uuid).await.unwrap();
    assert_eq!(node.status, NodeStatus::Scheduled);
    assert_eq!(node.pool, Some(pool.uuid));
}

#[tokio::test]
async fn idle_machine_is_reused_before_creating_one() {
    let store = Store::new();
    store.insert_pool(active_pool(8, 16384)).await.unwrap();
    let mut idle = Machine::default();
    idle.machine_type = NodeType::Vm;
    idle.status = MachineStatus::Idle;
    idle.cores = 4;
    idle.ram = 8192;
    let idle = store.insert_machine(idle).await.unwrap();
    let node = store.insert_node(vm_node(2, 4096, 10)).await.unwrap();

    let scheduler = SchedulerService::with_defaults(store.clone());
    scheduler.iteration().await.unwrap();

    let machines = store.list_machines().await;
    assert_eq!(machines.len(), 1, "no new machine expected");
    let bound = store.get_machine(&idle.uuid).await.unwrap();
    assert_eq!(bound.node, Some(node.uuid));
    assert_eq!(bound.status, MachineStatus::Scheduled);
    let node = store.get_node(&node.uuid).await.unwrap();
    assert_eq!(node.status, NodeStatus::Scheduled);
}

#[tokio::test]
async fn hw_node_without_idle_hardware_goes_to_error() {
    let store = Store::new();
    store.insert_pool(active_pool(8, 16384)).await.unwrap();
    let mut node = vm_node(2, 4096, 10);
    node.node_type = NodeType::Hw;
    let node = store.insert_node(node).await.unwrap();

    let scheduler = SchedulerService::with_defaults(store.clone());
    scheduler.iteration().await.unwrap();

    let node = store.get_node(&node.uuid).await.unwrap();
    assert_eq!(node.status, NodeStatus::Error);
    assert!(!node.description.is_empty());
    assert!(store.list_machines().await.is_empty());
}

#[tokio::test]
async fn soft_anti_affinity_degrades_to_co_location() {
    let store = Store::new();
    let pool = store.insert_pool(active_pool(16, 32768)).await.unwrap();

    let policy = store
        .insert_placement_policy(PlacementPolicy::default())
        .await
        .unwrap();
    let mut first = vm_node(2, 4096, 10);
    first.placement_policies = vec![policy.uuid];
    let first = store.insert_node(first).await.unwrap();
    let mut second = vm_node(2, 4096, 10);
    second.placement_policies = vec![policy.uuid];
    let second = store.insert_node(second).await.unwrap();
    for node in &[first.uuid, second.uuid] {
        store
            .insert_policy_allocation(PolicyAllocation::new(*node, policy.uuid))
            .await
            .unwrap();
    }

    let scheduler = SchedulerService::with_defaults(store.clone());
    scheduler.iteration().await.unwrap();

    // the policy is honoured softly: with a single pool both nodes land
    // on it instead of erroring out
    for node in &[first.uuid, second.uuid] {
        let machine = store.get_machine(node).await.unwrap();
        assert_eq!(machine.pool, Some(pool.uuid));
    }
    assert_eq!(
        store.get_node(&first.uuid).await.unwrap().status,
        NodeStatus::Scheduled
    );
    assert_eq!(
        store.get_node(&second.uuid).await.unwrap().status,
        NodeStatus::Scheduled
    );
}

#[tokio::test]
async fn matching_pool_volume_is_reused() {
    let store = Store::new();
    let pool = store.insert_pool(active_pool(8, 16384)).await.unwrap();

    // an unbound pool volume with the same image, slightly smaller
    let mut spare = MachineVolume::default();
    spare.pool = Some(pool.uuid);
    spare.image = Some("ubuntu_24.04".into());
    spare.size = 8;
    let spare = store.insert_machine_volume(spare).await.unwrap();

    let node = store.insert_node(vm_node(2, 4096, 10)).await.unwrap();
    let scheduler = SchedulerService::with_defaults(store.clone());
    scheduler.iteration().await.unwrap();

    let volumes = store.list_machine_volumes().await;
    assert_eq!(volumes.len(), 1, "the spare volume should be reused");
    let reused = store.get_machine_volume(&spare.uuid).await.unwrap();
    assert_eq!(reused.machine, Some(node.uuid));
    assert_eq!(reused.size, 10, "grown to the requested size");
    assert!(reused.node_volume.is_some());
}

#[tokio::test]
async fn second_node_sees_the_first_ones_debit() {
    let store = Store::new();
    let pool = store.insert_pool(active_pool(4, 8192)).await.unwrap();
    store.insert_node(vm_node(3, 4096, 10)).await.unwrap();
    store.insert_node(vm_node(3, 4096, 10)).await.unwrap();

    let scheduler = SchedulerService::with_defaults(store.clone());
    scheduler.iteration().await.unwrap();

    // only one of the two fits; the pool debit within the iteration
    // filters the second one out
    let machines = store.list_machines().await;
    assert_eq!(machines.len(), 1);
    let pool = store.get_pool(&pool.uuid).await.unwrap();
    assert_eq!(pool.avail_cores, 1);
}

#[tokio::test]
async fn unassigned_pool_gets_a_builder_and_an_agent() {
    let store = Store::new();
    let mut pool = active_pool(8, 16384);
    pool.builder = None;
    pool.agent = None;
    let pool = store.insert_pool(pool).await.unwrap();

    let mut builder = Builder::default();
    builder.name = format!("{} test", common::POOL_BUILDER_PREFIX);
    let builder = store.insert_builder(builder).await.unwrap();
    let mut agent = MachineAgent::default();
    agent.status = MachineAgentStatus::Active;
    agent.capabilities = vec![MACHINE_POOL_CAP.into()];
    let agent = store.insert_machine_agent(agent).await.unwrap();

    let scheduler = SchedulerService::with_defaults(store.clone());
    scheduler.iteration().await.unwrap();

    let pool = store.get_pool(&pool.uuid).await.unwrap();
    assert_eq!(pool.builder, Some(builder.uuid));
    assert_eq!(pool.agent, Some(agent.uuid));
}
