//! Intent propagation of the node and volume builders.

use common::{
    builders::{NodeBuilder, VolumeBuilder},
    reconciler::Reconciler,
    IterationService,
};
use store_api::{v0::*, Store};

async fn scheduled_node(store: &Store) -> (Node, Machine) {
    let mut node = Node::default();
    node.name = "app-1".into();
    node.cores = 2;
    node.ram = 4096;
    node.image = "ubuntu_24.04".into();
    node.root_disk_size = 10;
    node.disk_spec = DiskSpec::root(10, Some(node.image.clone()));
    let node = store.insert_node(node).await.unwrap();

    let mut machine = Machine::default();
    machine.uuid = node.uuid;
    machine.name = node.name.clone();
    machine.cores = 2;
    machine.ram = 4096;
    machine.node = Some(node.uuid);
    machine.status = MachineStatus::Scheduled;
    let machine = store.insert_machine(machine).await.unwrap();
    (node, machine)
}

#[tokio::test]
async fn node_resource_waits_for_its_machine() {
    let store = Store::new();
    let mut node = Node::default();
    node.cores = 1;
    node.ram = 1024;
    node.image = "img".into();
    let node = store.insert_node(node).await.unwrap();

    let builder = Reconciler::new(NodeBuilder::new(), store.clone());
    builder.iteration().await.unwrap();
    assert!(store
        .find_target_resource(ResourceKind::Node, &node.uuid)
        .await
        .is_none());

    // once the scheduler materialises the machine the gate opens
    let mut machine = Machine::default();
    machine.uuid = node.uuid;
    machine.node = Some(node.uuid);
    store.insert_machine(machine).await.unwrap();
    builder.iteration().await.unwrap();
    assert!(store
        .find_target_resource(ResourceKind::Node, &node.uuid)
        .await
        .is_some());
}

#[tokio::test]
async fn node_resize_reaches_the_machine() {
    let store = Store::new();
    let (node, _) = scheduled_node(&store).await;
    let builder = Reconciler::new(NodeBuilder::new(), store.clone());
    builder.iteration().await.unwrap();

    let mut node = store.get_node(&node.uuid).await.unwrap();
    node.cores = 4;
    let node = store.update_node(node).await.unwrap();
    builder.iteration().await.unwrap();

    let machine = store.get_machine(&node.uuid).await.unwrap();
    assert_eq!(machine.cores, 4);
    assert_eq!(machine.status, MachineStatus::InProgress);
}

#[tokio::test]
async fn added_disk_spec_entry_creates_a_volume() {
    let store = Store::new();
    let (node, _) = scheduled_node(&store).await;
    let builder = Reconciler::new(NodeBuilder::new(), store.clone());
    builder.iteration().await.unwrap();
    assert!(store.list_volumes().await.is_empty());

    let mut node = store.get_node(&node.uuid).await.unwrap();
    node.disk_spec.volumes.push(DiskSpecEntry {
        index: 1,
        size: 20,
        image: None,
        boot: false,
        label: Some("data".into()),
        device_type: VolumeType::Qcow2,
    });
    let node = store.update_node(node).await.unwrap();
    builder.iteration().await.unwrap();

    // only the diff materialises; the root was handed out at placement
    let volumes = store.list_volumes().await;
    assert_eq!(volumes.len(), 1);
    let data = volumes.iter().find(|v| v.index == 1).unwrap();
    assert_eq!(data.size, 20);
    assert_eq!(data.node, Some(node.uuid));
}

#[tokio::test]
async fn root_image_change_forces_a_machine_update() {
    let store = Store::new();
    let (node, machine) = scheduled_node(&store).await;
    let builder = Reconciler::new(NodeBuilder::new(), store.clone());
    builder.iteration().await.unwrap();

    let machine_before = store.get_machine(&machine.uuid).await.unwrap();
    let mut node = store.get_node(&node.uuid).await.unwrap();
    node.disk_spec.volumes[0].image = Some("debian_13".into());
    store.update_node(node).await.unwrap();
    builder.iteration().await.unwrap();

    let machine_after = store.get_machine(&machine.uuid).await.unwrap();
    assert_eq!(machine_after.status, MachineStatus::InProgress);
    assert!(machine_after.updated_at > machine_before.updated_at);
}

#[tokio::test]
async fn node_inherits_the_machine_status() {
    let store = Store::new();
    let (node, machine) = scheduled_node(&store).await;
    let builder = Reconciler::new(NodeBuilder::new(), store.clone());
    builder.iteration().await.unwrap();

    let mut machine = store.get_machine(&machine.uuid).await.unwrap();
    machine.status = MachineStatus::Active;
    store.update_machine(machine).await.unwrap();
    builder.iteration().await.unwrap();

    assert_eq!(
        store.get_node(&node.uuid).await.unwrap().status,
        NodeStatus::Active
    );
}

#[tokio::test]
async fn deleted_hw_node_returns_its_machine_to_idle() {
    let store = Store::new();
    let mut node = Node::default();
    node.cores = 2;
    node.ram = 4096;
    node.image = "img".into();
    node.node_type = NodeType::Hw;
    let node = store.insert_node(node).await.unwrap();
    let mut machine = Machine::default();
    machine.machine_type = NodeType::Hw;
    machine.cores = 8;
    machine.ram = 32768;
    machine.node = Some(node.uuid);
    let machine = store.insert_machine(machine).await.unwrap();

    let builder = Reconciler::new(NodeBuilder::new(), store.clone());
    builder.iteration().await.unwrap();

    store.delete_node(&node.uuid).await;
    builder.iteration().await.unwrap();

    let machine = store.get_machine(&machine.uuid).await.unwrap();
    assert_eq!(machine.node, None);
    assert_eq!(machine.status, MachineStatus::Idle);
}

#[tokio::test]
async fn user_volume_mirrors_its_pool_volume() {
    let store = Store::new();
    let (node, machine) = scheduled_node(&store).await;

    let mut volume = Volume::default();
    volume.node = Some(node.uuid);
    volume.size = 10;
    volume.index = 0;
    let volume = store.insert_volume(volume).await.unwrap();

    let mut machine_volume = MachineVolume::default();
    machine_volume.uuid = volume.uuid;
    machine_volume.node_volume = Some(volume.uuid);
    machine_volume.size = 10;
    machine_volume.index = 0;
    machine_volume.pool = Some(uuid::Uuid::new_v4());
    let machine_volume = store.insert_machine_volume(machine_volume).await.unwrap();

    let builder = Reconciler::new(VolumeBuilder::new(), store.clone());
    builder.iteration().await.unwrap();

    // growth flows down and the attachment follows the node's machine
    let mut volume = store.get_volume(&volume.uuid).await.unwrap();
    volume.size = 20;
    store.update_volume(volume.clone()).await.unwrap();
    builder.iteration().await.unwrap();
    let machine_volume = store.get_machine_volume(&machine_volume.uuid).await.unwrap();
    assert_eq!(machine_volume.size, 20);
    assert_eq!(machine_volume.machine, Some(machine.uuid));
    assert_eq!(machine_volume.status, VolumeStatus::InProgress);

    // observed status flows back up
    let mut machine_volume = machine_volume;
    machine_volume.status = VolumeStatus::Active;
    store.update_machine_volume(machine_volume).await.unwrap();
    builder.iteration().await.unwrap();
    assert_eq!(
        store.get_volume(&volume.uuid).await.unwrap().status,
        VolumeStatus::Active
    );
}
