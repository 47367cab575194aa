//! Lifecycle watcher
//!
//! Subscribes to the container runtime's event stream and keeps the
//! registry and proxy in lockstep with what is actually running: a start
//! event publishes the instance's route, a stop or die event retracts it
//! and purges the record. Every (re)subscription is preceded by a full
//! reconciliation pass so routes lost to a crash or missed events are
//! healed before live dispatch resumes.

use crate::config::InstancerConfig;
use crate::error::{InstancerError, Result};
use crate::instance::{derive_hostname, Instance, InstanceState, ProxyRecord};
use crate::proxy::ProxySynchronizer;
use crate::registry::Registry;
use crate::runtime::{
    ContainerRuntime, EventAction, ManagedContainer, RuntimeEvent, LABEL_CHALLENGE,
    LABEL_CHALLENGE_ID, LABEL_INSTANCE, LABEL_MANAGED, LABEL_OWNER, LABEL_PORT,
};
use crate::template::RouteParams;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

pub struct LifecycleWatcher {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<ProxySynchronizer>,
    config: InstancerConfig,
}

impl LifecycleWatcher {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<ProxySynchronizer>,
        config: InstancerConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            proxy,
            config,
        }
    }

    /// Subscribe, reconcile, dispatch until the stream ends, then resubscribe
    /// with exponential backoff. Returns only on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF_SECS;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.runtime.events().await {
                Ok(mut events) => {
                    // Heal anything that changed while we were not listening.
                    match self.reconcile().await {
                        Ok(0) => {}
                        Ok(n) => warn!("Reconciliation left {} unresolved containers", n),
                        Err(e) => warn!("Reconciliation failed: {}", e),
                    }
                    backoff = INITIAL_BACKOFF_SECS;
                    info!("Watching container lifecycle events");
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    info!("Lifecycle watcher shutting down");
                                    return;
                                }
                            }
                            event = events.next() => match event {
                                Some(Ok(event)) => {
                                    if let Err(e) = self.handle_event(&event).await {
                                        warn!(
                                            "Failed to handle {:?} for {}: {}",
                                            event.action, event.container_id, e
                                        );
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!("Event stream error: {}", e);
                                    break;
                                }
                                None => {
                                    warn!("Event stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!("Failed to subscribe to runtime events: {}", e),
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }
    }

    pub async fn handle_event(&self, event: &RuntimeEvent) -> Result<()> {
        match event.action {
            EventAction::Create => self.handle_create(event),
            EventAction::Start => self.handle_start(event).await,
            EventAction::Stop | EventAction::Die => self.handle_exit(event).await,
            EventAction::Other(ref action) => {
                debug!("Ignoring {} event for {}", action, event.container_id);
                Ok(())
            }
        }
    }

    /// Record the container as pending before it starts, so a crash between
    /// create and start still leaves something for reconciliation to purge.
    fn handle_create(&self, event: &RuntimeEvent) -> Result<()> {
        if self.registry.get_by_container(&event.container_id)?.is_some() {
            return Ok(());
        }
        if let Some(inst) = self.instance_from_labels(&event.container_id, &event.attributes) {
            debug!("Recording pending instance {}", inst.instance_id);
            self.registry.upsert_instance(&inst)?;
        }
        Ok(())
    }

    async fn handle_start(&self, event: &RuntimeEvent) -> Result<()> {
        let inst = match self.registry.get_by_container(&event.container_id)? {
            Some(inst) => inst,
            None => {
                let Some(inst) =
                    self.instance_from_labels(&event.container_id, &event.attributes)
                else {
                    debug!("Start event for unmanaged container {}", event.container_id);
                    return Ok(());
                };
                self.registry.upsert_instance(&inst)?;
                inst
            }
        };

        let port = label_port(&event.attributes, self.config.default_challenge_port);
        let ip = match self.runtime.resolve_ip(&event.container_id).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(
                    "Could not resolve address for {}: {}; marking errored",
                    event.container_id, e
                );
                let _ = self.registry.transition(&inst.instance_id, InstanceState::Error);
                if let Err(e) = self.runtime.remove_container(&event.container_id).await {
                    warn!("Failed to remove unreachable container: {}", e);
                }
                return Ok(());
            }
        };

        let mut inst = inst;
        inst.internal_address = Some(format!("{}:{}", ip, port));
        inst.last_seen_event_at = Some(Utc::now());
        self.registry.upsert_instance(&inst)?;
        if inst.state != InstanceState::Running {
            self.registry
                .transition(&inst.instance_id, InstanceState::Running)?;
        }
        self.publish_route(&inst, &ip, port).await
    }

    async fn handle_exit(&self, event: &RuntimeEvent) -> Result<()> {
        let inst = match self.registry.get_by_container(&event.container_id)? {
            Some(inst) => inst,
            None => {
                debug!(
                    "Dropping exit event for unknown container {}",
                    event.container_id
                );
                return Ok(());
            }
        };

        info!(
            "Instance {} container exited, retracting {}",
            inst.instance_id, inst.hostname
        );
        self.retract_route(&inst).await;
        if inst.state.can_transition(InstanceState::Stopped) {
            let _ = self
                .registry
                .transition(&inst.instance_id, InstanceState::Stopped);
        }
        self.registry.remove(&inst.instance_id)?;
        // Exited containers are not auto-removed; clean them up here so
        // they do not accumulate in the runtime.
        if let Err(e) = self.runtime.remove_container(&event.container_id).await {
            warn!(
                "Failed to remove exited container {}: {}",
                event.container_id, e
            );
        }
        Ok(())
    }

    /// Full diff between the runtime's managed containers and the registry.
    /// Returns how many containers could not be brought into sync.
    pub async fn reconcile(&self) -> Result<usize> {
        let containers = self.runtime.list_managed().await?;
        let by_id: HashMap<&str, &ManagedContainer> = containers
            .iter()
            .map(|c| (c.container_id.as_str(), c))
            .collect();
        let mut failures = 0;

        // Registry rows whose container is gone or exited are stale: drop
        // route + row, and drop the exited container itself (a missed die
        // event must not leave a dangling route behind). A pending row with
        // a not-yet-started container is left for its start event.
        for inst in self.registry.list_all()? {
            let container = by_id.get(inst.container_id.as_str());
            if container.map(|c| c.running).unwrap_or(false) {
                continue;
            }
            if container.is_some() && inst.state == InstanceState::Pending {
                continue;
            }
            info!(
                "Instance {} container is gone or exited, purging stale record",
                inst.instance_id
            );
            self.retract_route(&inst).await;
            if inst.state.can_transition(InstanceState::Stopped) {
                let _ = self
                    .registry
                    .transition(&inst.instance_id, InstanceState::Stopped);
            }
            if let Err(e) = self.registry.remove(&inst.instance_id) {
                warn!("Failed to purge stale instance {}: {}", inst.instance_id, e);
                failures += 1;
                continue;
            }
            if container.is_some() {
                if let Err(e) = self.runtime.remove_container(&inst.container_id).await {
                    warn!(
                        "Failed to remove exited container {}: {}",
                        inst.container_id, e
                    );
                }
            }
        }

        // Running containers must have a registry row and a published route.
        // Non-running containers are left for the event stream to settle.
        for container in containers.iter().filter(|c| c.running) {
            if let Err(e) = self.ensure_running(container).await {
                warn!(
                    "Failed to reconcile running container {}: {}",
                    container.container_id, e
                );
                failures += 1;
            }
        }

        Ok(failures)
    }

    async fn ensure_running(&self, container: &ManagedContainer) -> Result<()> {
        let inst = match self.registry.get_by_container(&container.container_id)? {
            Some(inst) => inst,
            None => {
                let Some(inst) =
                    self.instance_from_labels(&container.container_id, &container.labels)
                else {
                    return Ok(());
                };
                info!(
                    "Adopting unrecorded container {} as instance {}",
                    container.container_id, inst.instance_id
                );
                self.registry.upsert_instance(&inst)?;
                inst
            }
        };

        let port = label_port(&container.labels, self.config.default_challenge_port);
        let ip = self.runtime.resolve_ip(&container.container_id).await?;

        let mut inst = inst;
        inst.internal_address = Some(format!("{}:{}", ip, port));
        self.registry.upsert_instance(&inst)?;
        if inst.state != InstanceState::Running && inst.state.can_transition(InstanceState::Running)
        {
            self.registry
                .transition(&inst.instance_id, InstanceState::Running)?;
        }

        let routed = self
            .registry
            .get_route(&inst.hostname)?
            .map(|r| r.enabled && r.config_path.exists())
            .unwrap_or(false);
        if !routed {
            self.publish_route(&inst, &ip, port).await?;
        }
        Ok(())
    }

    async fn publish_route(&self, inst: &Instance, ip: &str, port: u16) -> Result<()> {
        let params = RouteParams {
            hostname: inst.hostname.clone(),
            container_ip: ip.to_string(),
            container_port: port,
            challenge_name: inst.challenge_slug.clone(),
            container_id: inst.container_id.clone(),
            timestamp: inst.created_at,
        };
        let config_path = self.proxy.publish(&params).await?;
        self.registry.put_route(&ProxyRecord {
            hostname: inst.hostname.clone(),
            instance_id: inst.instance_id.clone(),
            target_address: params.target_address(),
            config_path,
            enabled: true,
        })
    }

    /// Best-effort retraction: an already-absent route is not an error here.
    async fn retract_route(&self, inst: &Instance) {
        match self.proxy.retract(&inst.hostname).await {
            Ok(()) | Err(InstancerError::UnknownHostname(_)) => {}
            Err(e) => warn!("Failed to retract route {}: {}", inst.hostname, e),
        }
        if let Err(e) = self.registry.delete_route(&inst.hostname) {
            warn!("Failed to drop route record {}: {}", inst.hostname, e);
        }
    }

    /// Build a pending instance row from container labels. Returns None for
    /// containers not carrying the managed label set.
    fn instance_from_labels(
        &self,
        container_id: &str,
        labels: &HashMap<String, String>,
    ) -> Option<Instance> {
        if labels.get(LABEL_MANAGED).map(String::as_str) != Some("true") {
            return None;
        }
        let slug = labels.get(LABEL_CHALLENGE)?.clone();
        let owner = labels.get(LABEL_OWNER).cloned();
        let instance_id = labels
            .get(LABEL_INSTANCE)
            .cloned()
            .unwrap_or_else(|| container_id.chars().take(12).collect());
        let now = Utc::now();
        Some(Instance {
            instance_id,
            challenge_id: labels
                .get(LABEL_CHALLENGE_ID)
                .cloned()
                .unwrap_or_else(|| slug.clone()),
            owner_id: owner.clone().unwrap_or_default(),
            container_id: container_id.to_string(),
            hostname: derive_hostname(&slug, owner.as_deref(), &self.config.challenge_domain),
            challenge_slug: slug,
            internal_address: None,
            state: InstanceState::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.default_instance_ttl_secs as i64),
            last_seen_event_at: Some(now),
        })
    }
}

fn label_port(labels: &HashMap<String, String>, default: u16) -> u16 {
    labels
        .get(LABEL_PORT)
        .and_then(|p| p.parse().ok())
        .unwrap_or(default)
}
