//! Reservation discipline of the machine build coordinator.

use common::{builders::MachineBuilderService, IterationService};
use store_api::{v0::*, Store};
use uuid::Uuid;

async fn pool_with(store: &Store, all_cores: i64, all_ram: i64) -> MachinePool {
    let mut pool = MachinePool::default();
    pool.status = MachinePoolStatus::Active;
    pool.all_cores = all_cores;
    pool.all_ram = all_ram;
    pool.avail_cores = all_cores;
    pool.avail_ram = all_ram;
    store.insert_pool(pool).await.unwrap()
}

async fn in_build_machine(
    store: &Store,
    pool: &MachinePool,
    builder: Uuid,
    cores: u32,
    ram: u64,
) -> Machine {
    let mut machine = Machine::default();
    machine.cores = cores;
    machine.ram = ram;
    machine.pool = Some(pool.uuid);
    machine.builder = Some(builder);
    machine.build_status = MachineBuildStatus::InBuild;
    store.insert_machine(machine).await.unwrap()
}

#[tokio::test]
async fn fitting_machine_is_reserved_and_marked_ready() {
    let store = Store::new();
    let builder_uuid = Uuid::new_v4();
    let pool = pool_with(&store, 8, 16384).await;
    let machine = in_build_machine(&store, &pool, builder_uuid, 2, 4096).await;

    let service = MachineBuilderService::new(builder_uuid, store.clone());
    service.iteration().await.unwrap();

    // the builder registered itself
    let registered = store.get_builder(&builder_uuid).await.unwrap();
    assert!(registered.name.starts_with(common::MACHINE_BUILDER_PREFIX));

    let machine = store.get_machine(&machine.uuid).await.unwrap();
    assert_eq!(machine.build_status, MachineBuildStatus::Ready);
    assert_eq!(machine.builder, None);
    // the machine's own debit replaces the reservation
    assert!(store.list_reservations().await.is_empty());
}

#[tokio::test]
async fn oversized_machine_returns_to_the_scheduler() {
    let store = Store::new();
    let builder_uuid = Uuid::new_v4();
    let pool = pool_with(&store, 4, 4096).await;
    let machine = in_build_machine(&store, &pool, builder_uuid, 8, 16384).await;

    let service = MachineBuilderService::new(builder_uuid, store.clone());
    service.iteration().await.unwrap();

    let machine = store.get_machine(&machine.uuid).await.unwrap();
    assert_eq!(machine.pool, None);
    assert_eq!(machine.builder, None);
    assert_eq!(machine.build_status, MachineBuildStatus::InBuild);
    assert!(store.list_reservations().await.is_empty());
}

#[tokio::test]
async fn acquisition_is_best_effort_per_machine() {
    let store = Store::new();
    let builder_uuid = Uuid::new_v4();
    let pool = pool_with(&store, 8, 16384).await;
    let small = in_build_machine(&store, &pool, builder_uuid, 6, 8192).await;
    let big = in_build_machine(&store, &pool, builder_uuid, 6, 8192).await;

    let service = MachineBuilderService::new(builder_uuid, store.clone());
    service.iteration().await.unwrap();

    // exactly one of the two fits; the other went back to the scheduler
    let small = store.get_machine(&small.uuid).await.unwrap();
    let big = store.get_machine(&big.uuid).await.unwrap();
    let ready = [&small, &big]
        .iter()
        .filter(|m| m.build_status == MachineBuildStatus::Ready)
        .count();
    let returned = [&small, &big]
        .iter()
        .filter(|m| m.pool.is_none() && m.builder.is_none())
        .count();
    assert_eq!(ready, 1);
    assert_eq!(returned, 1);
}

#[tokio::test]
async fn existing_reservations_are_counted() {
    let store = Store::new();
    let builder_uuid = Uuid::new_v4();
    let pool = pool_with(&store, 8, 16384).await;
    let machine = in_build_machine(&store, &pool, builder_uuid, 4, 8192).await;

    // half of the capacity is already held for the machine
    let mut held = MachinePoolReservation::default();
    held.pool = pool.uuid;
    held.machine = Some(machine.uuid);
    held.cores = 4;
    held.ram = 4096;
    store.insert_reservation(held).await.unwrap();

    let service = MachineBuilderService::new(builder_uuid, store.clone());
    service.iteration().await.unwrap();

    let machine = store.get_machine(&machine.uuid).await.unwrap();
    assert_eq!(machine.build_status, MachineBuildStatus::Ready);
}
