//! Generic target-vs-actual reconciliation engine.
//!
//! One iteration loop drives every builder. A builder projects its
//! instances (store rows) into uniform target resources, and the engine
//! walks each declared kind in dependency order: new instances are
//! admitted through the readiness gate and the `can_create` hook,
//! user-updated instances re-materialise their derivatives, divergence
//! observed on the data plane is folded back into the instance, and
//! orphaned targets are deleted. All hooks must be idempotent; on a
//! steady state a repeated turn performs no writes.

use crate::{errors::SvcError, IterationService};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use store_api::{
    v0::{content_hash, Resource, ResourceId, ResourceKind, TargetResource},
    Store,
};
use uuid::Uuid;

/// Projection of one instance into the uniform resource model
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// resource kind of the instance
    pub kind: ResourceKind,
    /// stable identity, shared with the instance row
    pub uuid: Uuid,
    /// target fields of the instance
    pub payload: Value,
    /// agent the instance resource is scheduled to
    pub agent: Option<Uuid>,
    /// resources that must exist before the instance may be created
    pub readiness: Vec<ResourceId>,
    /// resources whose changes the instance wants to react to
    pub tracked: Vec<ResourceId>,
}

impl InstanceSpec {
    /// New instance projection with no dependencies
    pub fn new(kind: ResourceKind, uuid: Uuid, payload: Value) -> Self {
        Self {
            kind,
            uuid,
            payload,
            agent: None,
            readiness: vec![],
            tracked: vec![],
        }
    }
}

/// Derivative target resource materialised alongside an instance
#[derive(Debug, Clone)]
pub struct Derivative {
    /// kind of the derivative
    pub kind: ResourceKind,
    /// identity, usually shared with the owning instance
    pub uuid: Uuid,
    /// target fields of the derivative
    pub payload: Value,
    /// agent the derivative is scheduled to
    pub agent: Option<Uuid>,
}

/// Target plus optional observed state of one derivative
#[derive(Debug, Clone)]
pub struct DerivativePair {
    /// the desired form
    pub target: TargetResource,
    /// the observed form, absent until the agent reports it
    pub actual: Option<Resource>,
}

/// Hooks a concrete builder provides to the engine. Defaults make every
/// optional hook a no-op so a builder only states what it cares about.
#[async_trait]
pub trait InstanceBuilder: Send + Sync {
    /// Opaque per-iteration context
    type Context: Send + Sync;

    /// Name of the builder, used in logs
    fn name(&self) -> &str;

    /// Kinds handled by this builder, in dependency order
    fn kinds(&self) -> &[ResourceKind];

    /// Derivative kinds materialised for instances of `kind`
    fn derivative_kinds(&self, _kind: ResourceKind) -> &'static [ResourceKind] {
        &[]
    }

    /// Build the context used throughout the turn
    async fn prepare_iteration(&self, store: &Store) -> Result<Self::Context, SvcError>;

    /// Current instances of `kind` this builder owns
    async fn instances(
        &self,
        store: &Store,
        kind: ResourceKind,
        ctx: &Self::Context,
    ) -> Result<Vec<InstanceSpec>, SvcError>;

    /// Gate for new instances; `false` skips the instance this turn
    async fn can_create(
        &self,
        _store: &Store,
        _instance: &InstanceSpec,
        _ctx: &Self::Context,
    ) -> Result<bool, SvcError> {
        Ok(true)
    }

    /// Derivatives to materialise on create and on update. `pairs` is
    /// empty on create and carries the current derivative state on
    /// update.
    async fn derivatives(
        &self,
        _store: &Store,
        _instance: &InstanceSpec,
        _pairs: &[DerivativePair],
        _ctx: &Self::Context,
    ) -> Result<Vec<Derivative>, SvcError> {
        Ok(vec![])
    }

    /// Called after a new instance resource and its derivatives landed
    async fn post_create(
        &self,
        _store: &Store,
        _instance: &InstanceSpec,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        Ok(())
    }

    /// Gate for user updates; `false` skips the instance this turn
    async fn can_update(
        &self,
        _store: &Store,
        _instance: &InstanceSpec,
        _target: &TargetResource,
        _ctx: &Self::Context,
    ) -> Result<bool, SvcError> {
        Ok(true)
    }

    /// Called before an updated target resource is persisted
    async fn pre_update(
        &self,
        _store: &Store,
        _instance: &InstanceSpec,
        _target: &TargetResource,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        Ok(())
    }

    /// Fold a diverged same-kind observation back into the instance
    async fn actualize_outdated(
        &self,
        _store: &Store,
        _instance: &InstanceSpec,
        _actual: &Resource,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        Ok(())
    }

    /// React to diverged derivative observations; returned derivatives
    /// replace their stored targets
    async fn actualize_outdated_derivatives(
        &self,
        _store: &Store,
        _instance: &InstanceSpec,
        _pairs: &[DerivativePair],
        _ctx: &Self::Context,
    ) -> Result<Vec<Derivative>, SvcError> {
        Ok(vec![])
    }

    /// React to changes in tracked dependencies
    async fn actualize_with_outdated_tracked(
        &self,
        _store: &Store,
        _instance: &InstanceSpec,
        _ctx: &Self::Context,
    ) -> Result<(), SvcError> {
        Ok(())
    }

    /// Called before an orphaned target resource is deleted
    async fn pre_delete(&self, _store: &Store, _target: &TargetResource) -> Result<(), SvcError> {
        Ok(())
    }
}

/// Engine driving one `InstanceBuilder` per iteration
pub struct Reconciler<B: InstanceBuilder> {
    builder: B,
    store: Store,
}

impl<B: InstanceBuilder> Reconciler<B> {
    /// New engine over `builder` and `store`
    pub fn new(builder: B, store: Store) -> Self {
        Self { builder, store }
    }

    /// Access the wrapped builder
    pub fn builder(&self) -> &B {
        &self.builder
    }

    /// Run one full iteration over every declared kind
    pub async fn run_iteration(&self) -> Result<(), SvcError> {
        let ctx = self.builder.prepare_iteration(&self.store).await?;
        for &kind in self.builder.kinds() {
            if let Err(error) = self.run_kind(kind, &ctx).await {
                tracing::warn!(
                    "Builder '{}' failed on kind '{}': {}",
                    self.builder.name(),
                    kind.to_string(),
                    error
                );
            }
        }
        Ok(())
    }

    async fn run_kind(&self, kind: ResourceKind, ctx: &B::Context) -> Result<(), SvcError> {
        let store = &self.store;
        let instances = self.builder.instances(store, kind, ctx).await?;
        let targets: HashMap<Uuid, TargetResource> = store
            .list_target_resources(kind)
            .await
            .into_iter()
            .map(|t| (t.uuid, t))
            .collect();

        for instance in &instances {
            match targets.get(&instance.uuid) {
                None => self.create_instance(instance, ctx).await?,
                Some(target) => {
                    self.update_instance(instance, target, ctx).await?;
                    // Re-read: the update path may have moved the watermark
                    if let Some(target) = store.find_target_resource(kind, &instance.uuid).await {
                        self.actualize_instance(instance, &target, ctx).await?;
                    }
                }
            }
        }

        // Orphaned targets: the instance is gone, tear the resource down
        let alive: HashMap<Uuid, ()> = instances.iter().map(|i| (i.uuid, ())).collect();
        for (uuid, target) in targets {
            if alive.contains_key(&uuid) {
                continue;
            }
            self.builder.pre_delete(store, &target).await?;
            store.delete_target_resource(kind, &uuid).await;
            for &deriv_kind in self.builder.derivative_kinds(kind) {
                store.delete_target_resource(deriv_kind, &uuid).await;
            }
            tracing::info!(
                "Builder '{}' deleted resource '{}/{}'",
                self.builder.name(),
                kind.to_string(),
                uuid
            );
        }
        Ok(())
    }

    async fn create_instance(
        &self,
        instance: &InstanceSpec,
        ctx: &B::Context,
    ) -> Result<(), SvcError> {
        let store = &self.store;
        for ri in &instance.readiness {
            if !store.ri_exists(ri).await {
                tracing::debug!(
                    "Instance '{}/{}' is waiting for '{}/{}'",
                    instance.kind.to_string(),
                    instance.uuid,
                    ri.kind.to_string(),
                    ri.uuid
                );
                return Ok(());
            }
        }
        if !self.builder.can_create(store, instance, ctx).await? {
            return Ok(());
        }
        let derivatives = self.builder.derivatives(store, instance, &[], ctx).await?;
        store
            .save_target_resource(TargetResource::new(
                instance.kind,
                instance.uuid,
                instance.payload.clone(),
                instance.agent,
            ))
            .await;
        for derivative in derivatives {
            store
                .save_target_resource(TargetResource::new(
                    derivative.kind,
                    derivative.uuid,
                    derivative.payload,
                    derivative.agent,
                ))
                .await;
        }
        self.builder.post_create(store, instance, ctx).await?;
        tracing::info!(
            "Builder '{}' created resource '{}/{}'",
            self.builder.name(),
            instance.kind.to_string(),
            instance.uuid
        );
        Ok(())
    }

    async fn update_instance(
        &self,
        instance: &InstanceSpec,
        target: &TargetResource,
        ctx: &B::Context,
    ) -> Result<(), SvcError> {
        let store = &self.store;
        // A changed scheduling anchor is an update too, e.g. a pool
        // whose agent was assigned after the resource landed
        if content_hash(&instance.payload) == target.hash && instance.agent == target.agent {
            return Ok(());
        }
        if !self.builder.can_update(store, instance, target, ctx).await? {
            return Ok(());
        }
        self.builder.pre_update(store, instance, target, ctx).await?;
        let pairs = self.derivative_pairs(instance).await;
        let derivatives = self
            .builder
            .derivatives(store, instance, &pairs, ctx)
            .await?;
        let mut updated = target.clone();
        updated.payload = instance.payload.clone();
        updated.hash = content_hash(&instance.payload);
        updated.agent = instance.agent;
        store.save_target_resource(updated).await;
        self.persist_derivatives(derivatives).await;
        tracing::info!(
            "Builder '{}' updated resource '{}/{}'",
            self.builder.name(),
            instance.kind.to_string(),
            instance.uuid
        );
        Ok(())
    }

    /// Fold observed divergence back into the instance: same-kind
    /// actuals first, then derivative actuals, then tracked rows
    async fn actualize_instance(
        &self,
        instance: &InstanceSpec,
        target: &TargetResource,
        ctx: &B::Context,
    ) -> Result<(), SvcError> {
        let store = &self.store;
        let mut watermark = target.tracked_at;

        if let Some(actual) = store.find_resource(instance.kind, &instance.uuid).await {
            if actual.updated_at > watermark {
                self.builder
                    .actualize_outdated(store, instance, &actual, ctx)
                    .await?;
                watermark = watermark.max(actual.updated_at);
            }
        }

        if !self.builder.derivative_kinds(instance.kind).is_empty() {
            let pairs = self.derivative_pairs(instance).await;
            let newest = pairs
                .iter()
                .filter_map(|p| p.actual.as_ref())
                .map(|a| a.updated_at)
                .max();
            if let Some(newest) = newest {
                if newest > watermark {
                    let derivatives = self
                        .builder
                        .actualize_outdated_derivatives(store, instance, &pairs, ctx)
                        .await?;
                    self.persist_derivatives(derivatives).await;
                    watermark = watermark.max(newest);
                }
            }
        }

        if !instance.tracked.is_empty() {
            let newest = self.newest_tracked(&instance.tracked).await;
            if let Some(newest) = newest {
                if newest > watermark {
                    self.builder
                        .actualize_with_outdated_tracked(store, instance, ctx)
                        .await?;
                    watermark = watermark.max(newest);
                }
            }
        }

        if watermark > target.tracked_at {
            if let Some(mut current) = store
                .find_target_resource(instance.kind, &instance.uuid)
                .await
            {
                current.tracked_at = watermark;
                store.save_target_resource(current).await;
            }
        }
        Ok(())
    }

    async fn newest_tracked(&self, tracked: &[ResourceId]) -> Option<DateTime<Utc>> {
        let mut newest = None;
        for ri in tracked {
            let stamp = self.store.tracked_updated_at(ri).await;
            newest = newest.max(stamp);
        }
        newest
    }

    async fn derivative_pairs(&self, instance: &InstanceSpec) -> Vec<DerivativePair> {
        let mut pairs = vec![];
        for &kind in self.builder.derivative_kinds(instance.kind) {
            if let Some(target) = self.store.find_target_resource(kind, &instance.uuid).await {
                let actual = self.store.find_resource(kind, &instance.uuid).await;
                pairs.push(DerivativePair { target, actual });
            }
        }
        pairs
    }

    /// Persist derivative targets, skipping untouched ones so a steady
    /// state stays write-free
    async fn persist_derivatives(&self, derivatives: Vec<Derivative>) {
        for derivative in derivatives {
            let hash = content_hash(&derivative.payload);
            if let Some(existing) = self
                .store
                .find_target_resource(derivative.kind, &derivative.uuid)
                .await
            {
                if existing.hash == hash && existing.agent == derivative.agent {
                    continue;
                }
            }
            self.store
                .save_target_resource(TargetResource::new(
                    derivative.kind,
                    derivative.uuid,
                    derivative.payload,
                    derivative.agent,
                ))
                .await;
        }
    }
}

#[async_trait]
impl<B: InstanceBuilder> IterationService for Reconciler<B> {
    fn name(&self) -> &str {
        self.builder.name()
    }

    async fn iteration(&self) -> Result<(), SvcError> {
        self.run_iteration().await
    }
}

/// Find the derivative pair of `kind` among `pairs`
pub fn find_pair<'a>(pairs: &'a [DerivativePair], kind: ResourceKind) -> Option<&'a DerivativePair> {
    pairs.iter().find(|p| p.target.kind == kind)
}
