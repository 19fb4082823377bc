//! End-to-end convergence through the meta plane: scheduler, pool
//! builder and pool agent driving the in-memory hypervisor backend.

use common::{
    builders::PoolBuilder,
    driver::{self, PoolDriver},
    pool_agent::PoolAgentService,
    reconciler::Reconciler,
    scheduler::SchedulerService,
    IterationService,
};
use std::sync::Arc;
use store_api::{v0::*, Store};
use uuid::Uuid;

struct Cluster {
    store: Store,
    scheduler: SchedulerService,
    builder: Reconciler<PoolBuilder>,
    agent: PoolAgentService,
    pool: MachinePool,
}

/// One pool on the in-memory hypervisor with the whole service chain
async fn cluster() -> Cluster {
    driver::register_default_drivers();
    let store = Store::new();
    let builder_uuid = Uuid::new_v4();
    let agent_uuid = Uuid::new_v4();

    let mut pool = MachinePool::default();
    pool.status = MachinePoolStatus::Active;
    pool.builder = Some(builder_uuid);
    pool.agent = Some(agent_uuid);
    // a distinct spec per test run so each test gets a fresh backend
    pool.driver_spec = serde_json::json!({
        "driver": "mem",
        "all_cores": 8,
        "all_ram": 16384,
        "storage_pools": [
            { "name": format!("default-{}", Uuid::new_v4()), "capacity": 100, "pool_type": "dir" },
        ],
    });
    let pool = store.insert_pool(pool).await.unwrap();

    Cluster {
        scheduler: SchedulerService::with_defaults(store.clone()),
        builder: Reconciler::new(PoolBuilder::new(builder_uuid), store.clone()),
        agent: PoolAgentService::new(agent_uuid, store.clone(), None),
        store,
        pool,
    }
}

impl Cluster {
    /// A few turns of every service, enough for any single change to
    /// converge
    async fn converge(&self) {
        for _ in 0..4 {
            self.builder.iteration().await.unwrap();
            self.agent.iteration().await.unwrap();
            self.scheduler.iteration().await.unwrap();
        }
    }

    /// The driver instance backing the test pool
    fn driver(&self) -> Arc<dyn PoolDriver> {
        driver::load_driver(&self.pool).unwrap()
    }

    async fn add_node(&self, cores: u32, ram: u64, disk: u64) -> Node {
        let mut node = Node::default();
        node.name = "e2e-node".into();
        node.cores = cores;
        node.ram = ram;
        node.root_disk_size = disk;
        node.image = "ubuntu_24.04".into();
        node.disk_spec = DiskSpec::root(disk, Some(node.image.clone()));
        let node = self.store.insert_node(node).await.unwrap();

        let mut port = Port::default();
        port.node = Some(node.uuid);
        port.ipv4 = Some("10.0.0.7".parse().unwrap());
        port.mask = Some("255.255.255.0".parse().unwrap());
        port.mac = Some(Port::generate_mac(true));
        port.status = PortStatus::Active;
        self.store.insert_port(port).await.unwrap();
        node
    }
}

#[tokio::test]
async fn node_intent_reaches_the_hypervisor() {
    let cluster = cluster().await;
    let node = cluster.add_node(2, 4096, 10).await;
    cluster.converge().await;

    let snapshot = cluster.driver().list_pool_resources().await.unwrap();
    assert_eq!(snapshot.machines.len(), 1);
    let dp_machine = &snapshot.machines[0];
    assert_eq!(dp_machine.uuid, node.uuid);
    assert_eq!(dp_machine.cores, 2);
    assert_eq!(dp_machine.ram, 4096);
    assert_eq!(snapshot.volumes.len(), 1);
    // the root volume is attached by machine creation
    assert_eq!(snapshot.volumes[0].machine, Some(node.uuid));

    // capacity accounting holds on the observed pool
    let pool_actual = cluster
        .store
        .find_resource(ResourceKind::Pool, &cluster.pool.uuid)
        .await
        .expect("pool observation");
    assert_eq!(pool_actual.payload["all_cores"], 8);
    assert_eq!(pool_actual.payload["avail_cores"], 6);
    assert_eq!(pool_actual.payload["avail_ram"], 16384 - 4096);
}

#[tokio::test]
async fn oversubscription_is_applied_once() {
    let cluster = cluster().await;
    let mut pool = cluster.store.get_pool(&cluster.pool.uuid).await.unwrap();
    pool.cores_ratio = 2.0;
    cluster.store.update_pool(pool).await.unwrap();

    cluster.converge().await;

    let pool_actual = cluster
        .store
        .find_resource(ResourceKind::Pool, &cluster.pool.uuid)
        .await
        .expect("pool observation");
    assert_eq!(pool_actual.payload["all_cores"], 16);
    assert_eq!(pool_actual.payload["avail_cores"], 16);
}

#[tokio::test]
async fn guest_activity_rolls_up_to_the_node() {
    let cluster = cluster().await;
    let node = cluster.add_node(2, 4096, 10).await;
    cluster.converge().await;

    // the in-VM agent is out of scope; report its view directly
    cluster
        .store
        .save_resource(Resource::new(
            ResourceKind::GuestMachine,
            node.uuid,
            serde_json::json!({
                "uuid": node.uuid,
                "image": "ubuntu_24.04",
                "boot": "network",
                "status": "ACTIVE",
            }),
        ))
        .await;
    cluster.converge().await;

    let machine = cluster.store.get_machine(&node.uuid).await.unwrap();
    assert_eq!(machine.status, MachineStatus::Active);

    let node_builder = Reconciler::new(common::builders::NodeBuilder::new(), cluster.store.clone());
    node_builder.iteration().await.unwrap();
    node_builder.iteration().await.unwrap();
    let node = cluster.store.get_node(&node.uuid).await.unwrap();
    assert_eq!(node.status, NodeStatus::Active);
}

#[tokio::test]
async fn resize_reaches_the_data_plane() {
    let cluster = cluster().await;
    let node = cluster.add_node(2, 4096, 10).await;
    cluster.converge().await;

    // the node builder path: the user grew the node
    let mut machine = cluster.store.get_machine(&node.uuid).await.unwrap();
    machine.cores = 4;
    machine.status = MachineStatus::InProgress;
    cluster.store.update_machine(machine).await.unwrap();
    cluster.converge().await;

    let dp_machine = cluster.driver().get_machine(&node.uuid).await.unwrap();
    assert_eq!(dp_machine.cores, 4);
}

#[tokio::test]
async fn capacity_loss_surfaces_as_need_reschedule_and_releases() {
    let cluster = cluster().await;
    let node = cluster.add_node(2, 4096, 10).await;
    cluster.converge().await;
    assert!(cluster.store.find_machine(&node.uuid).await.is_some());

    // the control plane believes the pool is much larger than the
    // hypervisor really is
    let oversized = cluster.add_node(64, 4096, 10).await;
    let mut pool = cluster.store.get_pool(&cluster.pool.uuid).await.unwrap();
    pool.avail_cores = 200;
    pool.avail_ram = 200_000;
    cluster.store.update_pool(pool).await.unwrap();

    // the scheduler and the builder admit it on the stale numbers
    cluster.scheduler.iteration().await.unwrap();
    cluster.builder.iteration().await.unwrap();
    assert!(cluster
        .store
        .find_target_resource(ResourceKind::PoolMachine, &oversized.uuid)
        .await
        .is_some());

    // the agent knows better and refuses without failing the turn
    cluster.agent.iteration().await.unwrap();
    let actual = cluster
        .store
        .find_resource(ResourceKind::PoolMachine, &oversized.uuid)
        .await
        .expect("machine observation");
    assert_eq!(actual.payload["status"], "NEED_RESCHEDULE");
    let snapshot = cluster.driver().list_pool_resources().await.unwrap();
    assert!(snapshot.machines.iter().all(|m| m.uuid != oversized.uuid));

    // the builder releases the machine so the scheduler may try again
    cluster.builder.iteration().await.unwrap();
    assert!(cluster.store.find_machine(&oversized.uuid).await.is_none());
}

#[tokio::test]
async fn deleted_intent_drains_the_data_plane() {
    let cluster = cluster().await;
    let node = cluster.add_node(2, 4096, 10).await;
    cluster.converge().await;
    assert_eq!(
        cluster.driver().list_pool_resources().await.unwrap().machines.len(),
        1
    );

    // drop the control-plane records wholesale
    cluster.store.delete_machine(&node.uuid).await;
    for volume in cluster.store.list_machine_volumes().await {
        cluster.store.delete_machine_volume(&volume.uuid).await;
    }
    cluster.store.delete_node(&node.uuid).await;
    for volume in cluster.store.list_volumes().await {
        cluster.store.delete_volume(&volume.uuid).await;
    }

    // first pass drops the targets, the unknown-machine gate defers the
    // domain once, the next pass deletes it
    cluster.builder.iteration().await.unwrap();
    cluster.agent.iteration().await.unwrap();
    assert_eq!(
        cluster.driver().list_pool_resources().await.unwrap().machines.len(),
        1,
        "the first unknown sighting must defer"
    );
    cluster.agent.iteration().await.unwrap();

    let snapshot = cluster.driver().list_pool_resources().await.unwrap();
    assert!(snapshot.machines.is_empty());
    assert!(snapshot.volumes.is_empty());
    assert!(cluster
        .store
        .find_resource(ResourceKind::PoolMachine, &node.uuid)
        .await
        .is_none());
}

#[tokio::test]
async fn steady_state_issues_no_driver_mutations() {
    let cluster = cluster().await;
    cluster.add_node(2, 4096, 10).await;
    cluster.converge().await;

    let driver = cluster.driver();
    let mem = driver
        .as_any()
        .downcast_ref::<common::driver::MemPoolDriver>()
        .expect("mem driver");
    let ops_before = mem.mutating_ops();
    cluster.converge().await;
    assert_eq!(mem.mutating_ops(), ops_before);
}
