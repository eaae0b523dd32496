//! Instance registry: the `instances` list of the shared config file.

use chrono::{DateTime, Utc};

use crate::config::{ConfigStore, Instance};
use crate::error::ConfigError;
use crate::health::HealthClient;
use crate::process::is_pid_alive;

/// Fresh opaque instance id.
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    store: ConfigStore,
}

impl InstanceRegistry {
    pub fn new(store: ConfigStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn list(&self) -> Result<Vec<Instance>, ConfigError> {
        Ok(self.store.load()?.instances)
    }

    pub fn record_instance(&self, instance: Instance) -> Result<(), ConfigError> {
        tracing::debug!(
            target = "claude_proxy::registry",
            instance_id = %instance.id,
            http_port = instance.http_port,
            "recording instance"
        );
        self.store.update(|cfg| cfg.upsert_instance(instance))
    }

    /// Move `lastSeenAt` forward to `now`. Missing ids and timestamps that
    /// are not newer leave the record untouched. Returns whether it moved.
    pub fn heartbeat(&self, id: &str, now: DateTime<Utc>) -> Result<bool, ConfigError> {
        self.store.update(|cfg| {
            match cfg.instances.iter_mut().find(|inst| inst.id == id) {
                Some(inst) if now > inst.last_seen_at => {
                    inst.last_seen_at = now;
                    true
                }
                _ => false,
            }
        })
    }

    /// Idempotent. Returns whether a record was removed.
    pub fn remove_instance(&self, id: &str) -> Result<bool, ConfigError> {
        self.store.update(|cfg| cfg.remove_instance(id))
    }

    /// Drop records whose daemon process is gone and return them.
    pub fn prune_dead(&self) -> Result<Vec<Instance>, ConfigError> {
        self.store.update(|cfg| {
            let (alive, dead): (Vec<Instance>, Vec<Instance>) = cfg
                .instances
                .drain(..)
                .partition(|inst| is_pid_alive(inst.daemon_pid));
            cfg.instances = alive;
            dead
        })
    }
}

/// Newest live instance for `profile_id` whose health endpoint answers with
/// its own id. Dead or mismatched records are skipped, never returned.
pub async fn find_reusable_instance(
    instances: &[Instance],
    profile_id: &str,
    health: &HealthClient,
) -> Option<Instance> {
    let mut candidates: Vec<&Instance> = instances
        .iter()
        .filter(|inst| inst.profile_id == profile_id)
        .filter(|inst| is_pid_alive(inst.daemon_pid))
        .collect();
    candidates.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));

    for inst in candidates {
        match health.check_http_proxy(inst.http_port, &inst.id).await {
            Ok(()) => {
                tracing::info!(
                    target = "claude_proxy::registry",
                    instance_id = %inst.id,
                    http_port = inst.http_port,
                    "reusing running instance"
                );
                return Some(inst.clone());
            }
            Err(err) => {
                tracing::debug!(
                    target = "claude_proxy::registry",
                    instance_id = %inst.id,
                    error = %err,
                    "instance not reusable"
                );
            }
        }
    }
    None
}
