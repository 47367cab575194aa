//! Instance manager
//!
//! Owner-facing lifecycle operations: request a fresh instance, stop one,
//! and sweep expired instances. The one-active-instance-per-owner rule is
//! enforced under a per-(challenge, owner) lock so concurrent requests
//! cannot both create containers. Actual teardown is confirmed by the
//! lifecycle watcher; the manager only issues the stop.

use crate::config::InstancerConfig;
use crate::error::{InstancerError, Result};
use crate::instance::{derive_hostname, slugify, Instance, InstanceState};
use crate::registry::Registry;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, LABEL_CHALLENGE, LABEL_CHALLENGE_ID, LABEL_INSTANCE,
    LABEL_MANAGED, LABEL_OWNER, LABEL_PORT,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Everything needed to launch one challenge's container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSpec {
    pub challenge_id: String,
    /// Human-readable name; slugified for hostnames and container names.
    pub name: String,
    pub image: String,
    /// Port the challenge service listens on inside the container.
    pub internal_port: u16,
    /// Permit several live instances per owner (hostnames are then
    /// disambiguated with an instance-id suffix).
    #[serde(default)]
    pub allow_concurrent: bool,
    /// Per-challenge TTL override in seconds.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub env: Vec<String>,
}

pub struct InstanceManager {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    config: InstancerConfig,
    /// One lock per (challenge, owner) pair, held across check + create.
    owner_locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl InstanceManager {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        config: InstancerConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            config,
            owner_locks: DashMap::new(),
        }
    }

    /// Launch a new instance of `challenge` for `owner_id`. Fails with
    /// `AlreadyActive` while the owner has a pending or running instance of
    /// the same challenge. The returned instance is pending: the route is
    /// published by the watcher once the runtime reports the start.
    pub async fn request_instance(
        &self,
        challenge: &ChallengeSpec,
        owner_id: &str,
    ) -> Result<Instance> {
        let lock = self
            .owner_locks
            .entry((challenge.challenge_id.clone(), owner_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if !challenge.allow_concurrent {
            if let Some(existing) = self
                .registry
                .find_active(&challenge.challenge_id, owner_id)?
            {
                return Err(InstancerError::AlreadyActive {
                    challenge_id: challenge.challenge_id.clone(),
                    owner_id: owner_id.to_string(),
                    instance_id: existing.instance_id,
                });
            }
        }

        let instance_id = Uuid::new_v4().to_string();
        let challenge_slug = slugify(&challenge.name);
        let owner_slug = if challenge.allow_concurrent {
            // Concurrent instances need distinct hostnames.
            format!("{}-{}", slugify(owner_id), &instance_id[..8])
        } else {
            slugify(owner_id)
        };
        let hostname = derive_hostname(
            &challenge_slug,
            Some(&owner_slug),
            &self.config.challenge_domain,
        );

        let image = self.resolve_image(&challenge.image);
        self.runtime.ensure_image(&image).await?;

        let spec = ContainerSpec {
            name: format!("instancer-{}-{}", challenge_slug, &instance_id[..8]),
            image,
            env: challenge.env.clone(),
            labels: self.labels(challenge, &instance_id, &challenge_slug, &owner_slug),
            memory_limit: challenge.memory_limit.clone(),
            cpu_limit: challenge.cpu_limit,
            network_mode: None,
        };
        let container_id = self.runtime.create_container(&spec).await?;

        let now = Utc::now();
        let ttl = challenge
            .ttl_secs
            .unwrap_or(self.config.default_instance_ttl_secs);
        let inst = Instance {
            instance_id: instance_id.clone(),
            challenge_id: challenge.challenge_id.clone(),
            owner_id: owner_id.to_string(),
            container_id: container_id.clone(),
            challenge_slug,
            hostname,
            internal_address: None,
            state: InstanceState::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl as i64),
            last_seen_event_at: None,
        };

        if let Err(e) = self.registry.upsert_instance(&inst) {
            // The hostname is taken; roll the container back before failing.
            warn!("Registration of {} failed, removing container: {}", instance_id, e);
            if let Err(re) = self.runtime.remove_container(&container_id).await {
                warn!("Failed to remove orphaned container {}: {}", container_id, re);
            }
            return Err(e);
        }

        self.runtime.start_container(&container_id).await?;
        info!(
            "Instance {} of {} for {} launched as {}",
            instance_id, inst.challenge_id, owner_id, inst.hostname
        );
        Ok(inst)
    }

    /// Issue a stop for the instance's container. The record and route are
    /// removed once the watcher sees the resulting die event.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let inst = self
            .registry
            .get(instance_id)?
            .ok_or_else(|| InstancerError::UnknownInstance(instance_id.to_string()))?;

        self.runtime.stop_container(&inst.container_id).await?;
        if inst.state.can_transition(InstanceState::Stopping) {
            self.registry
                .transition(instance_id, InstanceState::Stopping)?;
        }
        info!("Instance {} stopping", instance_id);
        Ok(())
    }

    /// Stop every instance past its expiry. An unavailable runtime defers
    /// the sweep to the next tick instead of losing track of the instance.
    pub async fn check_expired(&self) -> Result<usize> {
        let expired = self.registry.list_expired(Utc::now())?;
        let mut stopped = 0;
        for inst in expired {
            info!("Instance {} expired, stopping", inst.instance_id);
            match self.stop_instance(&inst.instance_id).await {
                Ok(()) => stopped += 1,
                Err(e) if e.is_transient() => {
                    warn!(
                        "Deferring expiry of {} until runtime recovers: {}",
                        inst.instance_id, e
                    );
                }
                Err(e) => warn!("Failed to stop expired {}: {}", inst.instance_id, e),
            }
        }
        Ok(stopped)
    }

    /// Periodic TTL sweep; ticks every cleanup interval until shutdown.
    pub fn spawn_expiry_sweep(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let manager = self.clone();
        let interval = manager.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.check_expired().await {
                            warn!("Expiry sweep failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Bare image names are pulled from the configured registry.
    fn resolve_image(&self, image: &str) -> String {
        if image.contains('/') {
            image.to_string()
        } else {
            format!("{}/{}", self.config.docker_registry, image)
        }
    }

    fn labels(
        &self,
        challenge: &ChallengeSpec,
        instance_id: &str,
        challenge_slug: &str,
        owner_slug: &str,
    ) -> HashMap<String, String> {
        [
            (LABEL_MANAGED, "true"),
            (LABEL_INSTANCE, instance_id),
            (LABEL_CHALLENGE, challenge_slug),
            (LABEL_CHALLENGE_ID, challenge.challenge_id.as_str()),
            (LABEL_OWNER, owner_slug),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain(std::iter::once((
            LABEL_PORT.to_string(),
            challenge.internal_port.to_string(),
        )))
        .collect()
    }
}
