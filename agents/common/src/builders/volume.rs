//! Volume builder: keeps a user volume aligned with its backing pool
//! volume and mirrors the observed status back.

use crate::{
    errors::SvcError,
    reconciler::{InstanceBuilder, InstanceSpec},
};
use async_trait::async_trait;
use store_api::{v0::*, Store};
use uuid::Uuid;

const KINDS: [ResourceKind; 1] = [ResourceKind::Volume];

/// The volume builder
#[derive(Debug, Default)]
pub struct VolumeBuilder {}

impl VolumeBuilder {
    /// New volume builder
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool volume backing a user volume. Reused pool volumes keep
    /// their own uuid and point back through `node_volume`.
    async fn machine_volume_of(store: &Store, volume: &Uuid) -> Option<MachineVolume> {
        store
            .list_machine_volumes()
            .await
            .into_iter()
            .find(|mv| mv.node_volume == Some(*volume) || mv.uuid == *volume)
    }

    /// Push the user volume's shape down onto its pool volume.
    /// Attachment follows the node's machine.
    async fn actualize_machine_volume(store: &Store, volume: &Volume) -> Result<(), SvcError> {
        let machine_volume = match Self::machine_volume_of(store, &volume.uuid).await {
            Some(machine_volume) => machine_volume,
            None => return Ok(()),
        };

        let machine = match volume.node {
            Some(node) => store
                .list_machines()
                .await
                .into_iter()
                .find(|m| m.node == Some(node))
                .map(|m| m.uuid),
            None => None,
        };

        if machine_volume.size == volume.size
            && machine_volume.image == volume.image
            && machine_volume.label == volume.label
            && machine_volume.device_type == volume.device_type
            && machine_volume.boot == volume.boot
            && machine_volume.index == volume.index
            && machine_volume.machine == machine
        {
            return Ok(());
        }

        let mut machine_volume = machine_volume;
        machine_volume.size = volume.size;
        machine_volume.image = volume.image.clone();
        machine_volume.label = volume.label.clone();
        machine_volume.device_type = volume.device_type;
        machine_volume.boot = volume.boot;
        machine_volume.index = volume.index;
        machine_volume.machine = machine;
        machine_volume.status = VolumeStatus::InProgress;
        store.update_machine_volume(machine_volume).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceBuilder for VolumeBuilder {
    type Context = ();

    fn name(&self) -> &str {
        "volume-builder"
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
            .list_volumes()
            .await
            .into_iter()
            .map(|volume| {
                let mut spec = InstanceSpec::new(kind, volume.uuid, volume.target_payload());
                spec.readiness = vec![ResourceId::new(ResourceKind::PoolVolume, volume.uuid)];
                spec.tracked = vec![ResourceId::new(ResourceKind::PoolVolume, volume.uuid)];
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
        if let Some(volume) = store.find_volume(&instance.uuid).await {
            Self::actualize_machine_volume(store, &volume).await?;
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
        if let Some(volume) = store.find_volume(&instance.uuid).await {
            Self::actualize_machine_volume(store, &volume).await?;
        }
        Ok(())
    }

    async fn actualize_with_outdated_tracked(
        &self,
        store: &Store,
        instance: &InstanceSpec,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        let volume = match store.find_volume(&instance.uuid).await {
            Some(volume) => volume,
            None => return Ok(()),
        };
        let machine_volume = match Self::machine_volume_of(store, &volume.uuid).await {
            Some(machine_volume) => machine_volume,
            None => return Ok(()),
        };
        if volume.status != machine_volume.status || volume.pool != machine_volume.pool {
            let mut volume = volume;
            volume.status = machine_volume.status;
            volume.pool = machine_volume.pool;
            store.update_volume(volume).await?;
        }
        Ok(())
    }

    async fn pre_delete(&self, store: &Store, target: &TargetResource) -> Result<(), SvcError> {
        // Drop the backing pool volume; the pool agent detaches it from
        // its machine before deleting it on the data plane
        if let Some(machine_volume) = Self::machine_volume_of(store, &target.uuid).await {
            store.delete_machine_volume(&machine_volume.uuid).await;
        }
        Ok(())
    }
}
