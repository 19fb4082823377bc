//! Admission, derivative materialisation, boot transitions and status
//! rollup of the pool builder.

use common::{
    builders::PoolBuilder,
    reconciler::Reconciler,
    IterationService,
};
use store_api::{v0::*, Store};
use uuid::Uuid;

struct Fixture {
    store: Store,
    builder: Reconciler<PoolBuilder>,
    pool: MachinePool,
    node: Node,
    machine: Machine,
}

/// One pool owned by the builder with one scheduled machine, its root
/// volume and an active port
async fn fixture() -> Fixture {
    let store = Store::new();
    let builder_uuid = Uuid::new_v4();

    let mut pool = MachinePool::default();
    pool.status = MachinePoolStatus::Active;
    pool.driver_spec = serde_json::json!({ "driver": "dummy" });
    pool.builder = Some(builder_uuid);
    pool.agent = Some(Uuid::new_v4());
    pool.all_cores = 8;
    pool.all_ram = 16384;
    pool.avail_cores = 8;
    pool.avail_ram = 16384;
    pool.storage_pools = vec![ThinStoragePool {
        capacity_usable: 100,
        available_actual: 100.0,
        pool_type: StoragePoolType::Dir,
        oversubscription_ratio: StoragePoolType::Dir.oversubscription_ratio(),
        ..Default::default()
    }];
    let pool = store.insert_pool(pool).await.unwrap();

    let mut node = Node::default();
    node.name = "node-under-test".into();
    node.cores = 2;
    node.ram = 4096;
    node.image = "ubuntu_24.04".into();
    let node = store.insert_node(node).await.unwrap();

    let mut machine = Machine::default();
    machine.uuid = node.uuid;
    machine.name = node.name.clone();
    machine.cores = 2;
    machine.ram = 4096;
    machine.node = Some(node.uuid);
    machine.pool = Some(pool.uuid);
    machine.status = MachineStatus::Scheduled;
    let machine = store.insert_machine(machine).await.unwrap();

    let mut root = MachineVolume::default();
    root.uuid = node.uuid;
    root.index = 0;
    root.size = 10;
    root.image = Some(node.image.clone());
    root.pool = Some(pool.uuid);
    root.machine = Some(machine.uuid);
    root.node_volume = Some(node.uuid);
    store.insert_machine_volume(root).await.unwrap();

    let mut port = Port::default();
    port.node = Some(node.uuid);
    port.ipv4 = Some("10.0.0.5".parse().unwrap());
    port.mask = Some("255.255.255.0".parse().unwrap());
    port.mac = Some(Port::generate_mac(true));
    port.status = PortStatus::Active;
    store.insert_port(port).await.unwrap();

    let builder = Reconciler::new(PoolBuilder::new(builder_uuid), store.clone());
    Fixture {
        store,
        builder,
        pool,
        node,
        machine,
    }
}

#[tokio::test]
async fn new_machine_gets_both_derivatives_netbooting() {
    let fixture = fixture().await;
    fixture.builder.iteration().await.unwrap();

    let store = &fixture.store;
    let uuid = fixture.machine.uuid;
    assert!(store
        .find_target_resource(ResourceKind::Machine, &uuid)
        .await
        .is_some());
    let pool_machine = store
        .find_target_resource(ResourceKind::PoolMachine, &uuid)
        .await
        .expect("pool machine derivative");
    assert_eq!(pool_machine.agent, fixture.pool.agent);
    assert_eq!(pool_machine.payload["boot"], "network");
    let guest = store
        .find_target_resource(ResourceKind::GuestMachine, &uuid)
        .await
        .expect("guest machine derivative");
    assert_eq!(guest.agent, Some(uuid));
    assert_eq!(guest.payload["boot"], "network");
    assert_eq!(guest.payload["hostname"], "node-under-test");
    // the placeholder guest agent is in place
    assert!(store.find_machine_agent(&uuid).await.is_some());
    assert_eq!(
        store.get_machine(&uuid).await.unwrap().boot,
        BootAlternative::Network
    );
}

#[tokio::test]
async fn missing_port_defers_the_machine() {
    let fixture = fixture().await;
    for port in fixture.store.list_ports().await {
        fixture.store.delete_port(&port.uuid).await;
    }
    fixture.builder.iteration().await.unwrap();
    assert!(fixture
        .store
        .find_target_resource(ResourceKind::Machine, &fixture.machine.uuid)
        .await
        .is_none());
    // the machine itself survives, it is only deferred
    assert!(fixture.store.find_machine(&fixture.machine.uuid).await.is_some());
}

#[tokio::test]
async fn capacity_shortage_on_create_releases_the_machine() {
    let fixture = fixture().await;
    let mut pool = fixture.pool.clone();
    pool.avail_cores = 1;
    fixture.store.update_pool(pool).await.unwrap();

    fixture.builder.iteration().await.unwrap();

    // reschedule-by-release: the machine is gone so the scheduler can
    // pick another pool
    assert!(fixture.store.find_machine(&fixture.machine.uuid).await.is_none());
    assert!(fixture
        .store
        .find_target_resource(ResourceKind::Machine, &fixture.machine.uuid)
        .await
        .is_none());
}

#[tokio::test]
async fn capacity_shortage_on_update_fails_machine_and_node() {
    let fixture = fixture().await;
    fixture.builder.iteration().await.unwrap();

    let mut pool = fixture.pool.clone();
    pool.avail_cores = 0;
    fixture.store.update_pool(pool).await.unwrap();
    let mut machine = fixture.store.get_machine(&fixture.machine.uuid).await.unwrap();
    machine.cores = 4;
    fixture.store.update_machine(machine).await.unwrap();

    fixture.builder.iteration().await.unwrap();

    let machine = fixture.store.get_machine(&fixture.machine.uuid).await.unwrap();
    assert_eq!(machine.status, MachineStatus::Error);
    let node = fixture.store.get_node(&fixture.node.uuid).await.unwrap();
    assert_eq!(node.status, NodeStatus::Error);
}

#[tokio::test]
async fn flashed_guest_flips_boot_to_first_disk() {
    let fixture = fixture().await;
    fixture.builder.iteration().await.unwrap();

    // the guest reports it flashed the image during its netboot
    let guest_actual = serde_json::json!({
        "uuid": fixture.machine.uuid,
        "image": "ubuntu_24.04",
        "boot": "network",
        "status": "FLASHED",
    });
    fixture
        .store
        .save_resource(Resource::new(
            ResourceKind::GuestMachine,
            fixture.machine.uuid,
            guest_actual,
        ))
        .await;

    fixture.builder.iteration().await.unwrap();

    let machine = fixture.store.get_machine(&fixture.machine.uuid).await.unwrap();
    assert_eq!(machine.boot, BootAlternative::Hd0);
    let guest = fixture
        .store
        .find_target_resource(ResourceKind::GuestMachine, &fixture.machine.uuid)
        .await
        .unwrap();
    assert_eq!(guest.payload["boot"], "hd0");
    // the hypervisor keeps netbooting and chains into the guest firmware
    let pool_machine = fixture
        .store
        .find_target_resource(ResourceKind::PoolMachine, &fixture.machine.uuid)
        .await
        .unwrap();
    assert_eq!(pool_machine.payload["boot"], "network");
}

#[tokio::test]
async fn image_change_reverts_boot_to_network() {
    let fixture = fixture().await;
    fixture.builder.iteration().await.unwrap();

    // flash and flip first
    fixture
        .store
        .save_resource(Resource::new(
            ResourceKind::GuestMachine,
            fixture.machine.uuid,
            serde_json::json!({
                "uuid": fixture.machine.uuid,
                "image": "ubuntu_24.04",
                "boot": "network",
                "status": "FLASHED",
            }),
        ))
        .await;
    fixture.builder.iteration().await.unwrap();
    assert_eq!(
        fixture.store.get_machine(&fixture.machine.uuid).await.unwrap().boot,
        BootAlternative::Hd0
    );

    // now the user switches the root image
    let mut root = fixture
        .store
        .get_machine_volume(&fixture.machine.uuid)
        .await
        .unwrap();
    root.image = Some("debian_13".into());
    fixture.store.update_machine_volume(root).await.unwrap();
    let mut machine = fixture.store.get_machine(&fixture.machine.uuid).await.unwrap();
    machine.status = MachineStatus::InProgress;
    fixture.store.update_machine(machine).await.unwrap();

    fixture.builder.iteration().await.unwrap();
    fixture.builder.iteration().await.unwrap();

    let machine = fixture.store.get_machine(&fixture.machine.uuid).await.unwrap();
    assert_eq!(machine.boot, BootAlternative::Network);
    assert_eq!(machine.image.as_deref(), Some("debian_13"));
}

#[tokio::test]
async fn machine_status_follows_both_derivatives() {
    let fixture = fixture().await;
    fixture.builder.iteration().await.unwrap();

    let payload = |status: &str| {
        serde_json::json!({
            "uuid": fixture.machine.uuid,
            "image": "ubuntu_24.04",
            "boot": "hd0",
            "status": status,
        })
    };
    fixture
        .store
        .save_resource(Resource::new(
            ResourceKind::PoolMachine,
            fixture.machine.uuid,
            payload("ACTIVE"),
        ))
        .await;
    fixture
        .store
        .save_resource(Resource::new(
            ResourceKind::GuestMachine,
            fixture.machine.uuid,
            payload("IN_PROGRESS"),
        ))
        .await;
    fixture.builder.iteration().await.unwrap();
    assert_eq!(
        fixture.store.get_machine(&fixture.machine.uuid).await.unwrap().status,
        MachineStatus::InProgress
    );

    fixture
        .store
        .save_resource(Resource::new(
            ResourceKind::GuestMachine,
            fixture.machine.uuid,
            payload("ACTIVE"),
        ))
        .await;
    fixture.builder.iteration().await.unwrap();
    assert_eq!(
        fixture.store.get_machine(&fixture.machine.uuid).await.unwrap().status,
        MachineStatus::Active
    );
}

#[tokio::test]
async fn steady_state_iterations_do_not_write() {
    let fixture = fixture().await;
    fixture.builder.iteration().await.unwrap();
    fixture.builder.iteration().await.unwrap();

    let machine_before = fixture.store.get_machine(&fixture.machine.uuid).await.unwrap();
    let target_before = fixture
        .store
        .find_target_resource(ResourceKind::Machine, &fixture.machine.uuid)
        .await
        .unwrap();

    fixture.builder.iteration().await.unwrap();

    let machine_after = fixture.store.get_machine(&fixture.machine.uuid).await.unwrap();
    let target_after = fixture
        .store
        .find_target_resource(ResourceKind::Machine, &fixture.machine.uuid)
        .await
        .unwrap();
    assert_eq!(machine_before.updated_at, machine_after.updated_at);
    assert_eq!(target_before.updated_at, target_after.updated_at);
    assert_eq!(target_before.tracked_at, target_after.tracked_at);
}

#[tokio::test]
async fn deleted_machine_takes_its_guest_records_along() {
    let fixture = fixture().await;
    fixture.builder.iteration().await.unwrap();
    fixture
        .store
        .save_resource(Resource::new(
            ResourceKind::GuestMachine,
            fixture.machine.uuid,
            serde_json::json!({ "uuid": fixture.machine.uuid, "status": "ACTIVE" }),
        ))
        .await;

    fixture.store.delete_machine(&fixture.machine.uuid).await;
    fixture.builder.iteration().await.unwrap();

    let uuid = fixture.machine.uuid;
    assert!(fixture
        .store
        .find_target_resource(ResourceKind::Machine, &uuid)
        .await
        .is_none());
    assert!(fixture
        .store
        .find_target_resource(ResourceKind::GuestMachine, &uuid)
        .await
        .is_none());
    assert!(fixture
        .store
        .find_resource(ResourceKind::GuestMachine, &uuid)
        .await
        .is_none());
    assert!(fixture.store.find_machine_agent(&uuid).await.is_none());
}
