//! Machine build coordinator: registers itself as a builder, reserves
//! pool capacity for the machines it was handed, and marks fully
//! reserved machines ready to launch. Machines that do not fit are
//! returned to the scheduler.

use crate::{errors::SvcError, IterationService};
use async_trait::async_trait;
use std::collections::HashMap;
use store_api::{v0::*, Store};
use uuid::Uuid;

/// The machine build coordinator
pub struct MachineBuilderService {
    uuid: Uuid,
    store: Store,
}

impl MachineBuilderService {
    /// Coordinator with the service identity `uuid`
    pub fn new(uuid: Uuid, store: Store) -> Self {
        Self { uuid, store }
    }

    /// Keep the builder registration alive
    async fn actualize_status(&self) -> Result<(), SvcError> {
        if self.store.find_builder(&self.uuid).await.is_none() {
            let mut builder = Builder::default();
            builder.uuid = self.uuid;
            builder.name = format!(
                "{} {}",
                crate::MACHINE_BUILDER_PREFIX,
                &self.uuid.to_string()[..8]
            );
            builder.status = BuilderStatus::Active;
            self.store.save_builder(builder).await?;
        }
        Ok(())
    }

    /// Clear placement so the scheduler retries these machines
    async fn reschedule_machines(&self, machines: &[Uuid]) -> Result<(), SvcError> {
        for uuid in machines {
            if let Some(mut machine) = self.store.find_machine(uuid).await {
                machine.builder = None;
                machine.pool = None;
                machine.build_status = MachineBuildStatus::InBuild;
                self.store.update_machine(machine).await?;
            }
            for reservation in self.store.list_reservations().await {
                if reservation.machine == Some(*uuid) {
                    self.store.delete_reservation(&reservation.uuid).await;
                }
            }
        }
        Ok(())
    }

    /// The machine may launch; its own capacity debit replaces the
    /// reservations from here on
    async fn mark_machine_ready(&self, machine: &Machine) -> Result<(), SvcError> {
        if machine.build_status != MachineBuildStatus::Ready || machine.builder.is_some() {
            let mut machine = machine.clone();
            machine.build_status = MachineBuildStatus::Ready;
            machine.builder = None;
            let uuid = machine.uuid;
            self.store.update_machine(machine).await?;
            for reservation in self.store.list_reservations().await {
                if reservation.machine == Some(uuid) {
                    self.store.delete_reservation(&reservation.uuid).await;
                }
            }
            tracing::info!("Machine {} is ready", uuid);
        }
        Ok(())
    }

    /// Reservation still missing for a machine after subtracting what
    /// previous iterations already reserved
    fn missing_reservation(
        machine: &Machine,
        existing: &[MachinePoolReservation],
    ) -> Option<MachinePoolReservation> {
        let reserved_cores: u32 = existing.iter().map(|r| r.cores).sum();
        let reserved_ram: u64 = existing.iter().map(|r| r.ram).sum();
        let cores = machine.cores.saturating_sub(reserved_cores);
        let ram = machine.ram.saturating_sub(reserved_ram);
        if cores == 0 && ram == 0 {
            return None;
        }
        let mut reservation = MachinePoolReservation::default();
        reservation.machine = Some(machine.uuid);
        reservation.pool = machine.pool?;
        reservation.cores = cores;
        reservation.ram = ram;
        Some(reservation)
    }

    /// Acquire reservations against one pool, best effort per machine.
    /// Returns the acquired reservation uuids and the machines that must
    /// be rescheduled.
    async fn acquire_pool_reservations(
        &self,
        pool_uuid: Uuid,
        reservations: Vec<MachinePoolReservation>,
    ) -> Result<(Vec<Uuid>, Vec<Uuid>), SvcError> {
        let pool = match self.store.find_pool(&pool_uuid).await {
            Some(pool) => pool,
            None => {
                return Ok((
                    vec![],
                    reservations.iter().filter_map(|r| r.machine).collect(),
                ))
            }
        };
        let held = self.store.list_reservations().await;
        let held: Vec<_> = held.iter().filter(|r| r.pool == pool_uuid).collect();
        let mut avail_cores = pool.all_cores - held.iter().map(|r| r.cores as i64).sum::<i64>();
        let mut avail_ram = pool.all_ram - held.iter().map(|r| r.ram as i64).sum::<i64>();

        let mut by_machine: HashMap<Uuid, Vec<MachinePoolReservation>> = HashMap::new();
        for reservation in reservations {
            if let Some(machine) = reservation.machine {
                by_machine.entry(machine).or_default().push(reservation);
            }
        }

        let mut acquired = vec![];
        let mut reschedule = vec![];
        for (machine, machine_reservations) in by_machine {
            let req_cores: i64 = machine_reservations.iter().map(|r| r.cores as i64).sum();
            let req_ram: i64 = machine_reservations.iter().map(|r| r.ram as i64).sum();
            if avail_cores >= req_cores && avail_ram >= req_ram {
                for reservation in machine_reservations {
                    let uuid = reservation.uuid;
                    let (cores, ram) = (reservation.cores, reservation.ram);
                    self.store.save_reservation(reservation).await?;
                    tracing::info!(
                        "The reservation {}(cores={}, ram={}) has been created",
                        uuid,
                        cores,
                        ram
                    );
                    acquired.push(uuid);
                }
                avail_cores -= req_cores;
                avail_ram -= req_ram;
            } else {
                tracing::warn!(
                    "Not enough resources to create the reservation for the machine {}",
                    machine
                );
                reschedule.push(machine);
            }
        }
        Ok((acquired, reschedule))
    }

    async fn run_iteration(&self) -> Result<(), SvcError> {
        self.actualize_status().await?;

        let machines: Vec<Machine> = self
            .store
            .list_machines()
            .await
            .into_iter()
            .filter(|m| m.builder == Some(self.uuid))
            .collect();
        if machines.is_empty() {
            tracing::debug!("No machine to build");
            return Ok(());
        }

        let all_reservations = self.store.list_reservations().await;

        let mut new_reservations: HashMap<Uuid, Vec<MachinePoolReservation>> = HashMap::new();
        let mut waiting: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut ready: Vec<Uuid> = vec![];
        for machine in &machines {
            let existing: Vec<MachinePoolReservation> = all_reservations
                .iter()
                .filter(|r| r.machine == Some(machine.uuid))
                .cloned()
                .collect();
            match Self::missing_reservation(machine, &existing) {
                Some(reservation) => {
                    waiting
                        .entry(machine.uuid)
                        .or_default()
                        .push(reservation.uuid);
                    new_reservations
                        .entry(reservation.pool)
                        .or_default()
                        .push(reservation);
                }
                None => ready.push(machine.uuid),
            }
        }

        let mut acquired: Vec<Uuid> = vec![];
        let mut reschedule: Vec<Uuid> = vec![];
        for (pool, pool_reservations) in new_reservations {
            match self.acquire_pool_reservations(pool, pool_reservations).await {
                Ok((pool_acquired, pool_reschedule)) => {
                    acquired.extend(pool_acquired);
                    reschedule.extend(pool_reschedule);
                }
                Err(error) => {
                    tracing::error!("Error acquiring reservations for pool {}: {}", pool, error);
                }
            }
        }

        self.reschedule_machines(&reschedule).await?;

        for (machine, needed) in waiting {
            if needed.iter().all(|uuid| acquired.contains(uuid)) {
                ready.push(machine);
            }
        }
        for machine in &machines {
            if ready.contains(&machine.uuid) {
                if let Err(error) = self.mark_machine_ready(machine).await {
                    tracing::error!("Error marking machine {} as ready: {}", machine.uuid, error);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IterationService for MachineBuilderService {
    fn name(&self) -> &str {
        "machine-builder"
    }

    async fn iteration(&self) -> Result<(), SvcError> {
        self.run_iteration().await
    }
}
