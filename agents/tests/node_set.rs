//! Replica management of the node-set builder and the load-balancer
//! builder sitting on top of it.

use common::{
    builders::{LbBuilder, NodeSetBuilder},
    reconciler::Reconciler,
    IterationService,
};
use store_api::{v0::*, Store};

fn three_replica_set() -> NodeSet {
    let mut set = NodeSet::default();
    set.name = "workers".into();
    set.replicas = 3;
    set.cores = 2;
    set.ram = 2048;
    set.image = "ubuntu_24.04".into();
    set.root_disk_size = 10;
    set
}

#[tokio::test]
async fn replicas_materialise_with_deterministic_identities() {
    let store = Store::new();
    let set = store.insert_node_set(three_replica_set()).await.unwrap();
    let builder = Reconciler::new(NodeSetBuilder::new(), store.clone());
    builder.iteration().await.unwrap();

    let nodes = store.list_nodes().await;
    assert_eq!(nodes.len(), 3);
    for i in 0..3 {
        let expected = uuid5(&set.uuid, &format!("node-{}", i));
        let node = nodes
            .iter()
            .find(|n| n.uuid == expected)
            .expect("deterministic child uuid");
        assert_eq!(node.node_set, Some(set.uuid));
        assert_eq!(node.cores, 2);
        assert_eq!(node.placement_policies, vec![set.policy_uuid()]);
    }

    // the default policy and its allocations exist
    assert!(store.find_placement_policy(&set.policy_uuid()).await.is_some());
    assert_eq!(store.list_policy_allocations().await.len(), 3);
}

#[tokio::test]
async fn shrink_sheds_the_tail() {
    let store = Store::new();
    let set = store.insert_node_set(three_replica_set()).await.unwrap();
    let builder = Reconciler::new(NodeSetBuilder::new(), store.clone());
    builder.iteration().await.unwrap();
    assert_eq!(store.list_nodes().await.len(), 3);

    let mut set = store.get_node_set(&set.uuid).await.unwrap();
    set.replicas = 1;
    let set = store.update_node_set(set).await.unwrap();
    builder.iteration().await.unwrap();

    let nodes = store.list_nodes().await;
    assert_eq!(nodes.len(), 1);
    // index 0 survives, the tail is the shed set
    assert_eq!(nodes[0].uuid, set.node_uuid(0));
}

#[tokio::test]
async fn growth_appends_new_replicas() {
    let store = Store::new();
    let set = store.insert_node_set(three_replica_set()).await.unwrap();
    let builder = Reconciler::new(NodeSetBuilder::new(), store.clone());
    builder.iteration().await.unwrap();

    let mut set = store.get_node_set(&set.uuid).await.unwrap();
    set.replicas = 5;
    let set = store.update_node_set(set).await.unwrap();
    builder.iteration().await.unwrap();

    let nodes = store.list_nodes().await;
    assert_eq!(nodes.len(), 5);
    assert!(nodes.iter().any(|n| n.uuid == set.node_uuid(4)));
}

#[tokio::test]
async fn set_status_follows_the_children() {
    let store = Store::new();
    let set = store.insert_node_set(three_replica_set()).await.unwrap();
    let builder = Reconciler::new(NodeSetBuilder::new(), store.clone());
    builder.iteration().await.unwrap();

    for (index, node) in store.list_nodes().await.into_iter().enumerate() {
        let mut node = node;
        node.status = NodeStatus::Active;
        node.default_network = Some(PortInfo {
            ipv4: Some(format!("10.0.0.{}", index + 1).parse().unwrap()),
            ..Default::default()
        });
        store.update_node(node).await.unwrap();
    }
    builder.iteration().await.unwrap();

    let set = store.get_node_set(&set.uuid).await.unwrap();
    assert_eq!(set.status, NodeStatus::Active);
    assert_eq!(set.nodes.len(), 3);
    assert!(set.nodes.values().all(|m| m.ipv4.is_some()));

    // one child failing drags the set down
    let mut failing = store.list_nodes().await.pop().unwrap();
    failing.status = NodeStatus::Error;
    store.update_node(failing).await.unwrap();
    builder.iteration().await.unwrap();
    let set = store.get_node_set(&set.uuid).await.unwrap();
    assert_eq!(set.status, NodeStatus::Error);
}

#[tokio::test]
async fn deleted_set_takes_children_policy_and_allocations() {
    let store = Store::new();
    let set = store.insert_node_set(three_replica_set()).await.unwrap();
    let builder = Reconciler::new(NodeSetBuilder::new(), store.clone());
    builder.iteration().await.unwrap();

    store.delete_node_set(&set.uuid).await;
    builder.iteration().await.unwrap();

    assert!(store.list_nodes().await.is_empty());
    assert!(store.list_policy_allocations().await.is_empty());
    assert!(store.find_placement_policy(&set.policy_uuid()).await.is_none());
}

#[tokio::test]
async fn load_balancer_projects_onto_a_node_set() {
    let store = Store::new();
    let mut lb = LoadBalancer::default();
    lb.name = "edge".into();
    lb.image = "lb_image".into();
    lb.lb_type = LbType {
        cpu: 2,
        ram: 2048,
        disk_size: 10,
        nodes_number: 2,
    };
    let lb = store.insert_load_balancer(lb).await.unwrap();

    let lb_builder = Reconciler::new(LbBuilder::new(), store.clone());
    lb_builder.iteration().await.unwrap();

    let set = store.get_node_set(&lb.uuid).await.unwrap();
    assert_eq!(set.replicas, 2);
    assert_eq!(set.cores, 2);
    assert_eq!(set.image, "lb_image");
    assert!(set.name.starts_with("lbaas-"));

    // member addresses and status surface on the balancer
    let mut set = set;
    set.status = NodeStatus::Active;
    set.nodes.insert(
        set.node_uuid(0),
        NodeSetMember {
            ipv4: Some("10.0.0.21".parse().unwrap()),
        },
    );
    set.nodes.insert(
        set.node_uuid(1),
        NodeSetMember {
            ipv4: Some("10.0.0.22".parse().unwrap()),
        },
    );
    store.update_node_set(set).await.unwrap();
    lb_builder.iteration().await.unwrap();

    let lb = store.get_load_balancer(&lb.uuid).await.unwrap();
    assert_eq!(lb.status, NodeStatus::Active);
    assert_eq!(lb.ipsv4.len(), 2);
}
