//! Proxy synchronizer
//!
//! The only component that touches the reverse proxy's on-disk state.
//! `publish` writes a rendered server block into sites-available and links
//! it into sites-enabled; `retract` removes both. Every mutation is
//! validated with a dry-run check before the shared reload fires, and a
//! failing check rolls back only the triggering record. Reload requests
//! are funneled through a single coalescer task so a burst of publishes
//! triggers at most one reload per debounce window.

use crate::error::{InstancerError, Result};
use crate::template::{self, RouteParams, ROUTE_TEMPLATE};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// External proxy process control: syntax check (dry run) and reload.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    async fn check(&self) -> Result<()>;
    async fn reload(&self) -> Result<()>;
}

/// Drives nginx via its command line (`nginx -t` / `nginx -s reload`).
pub struct NginxControl {
    check_cmd: Vec<String>,
    reload_cmd: Vec<String>,
}

impl Default for NginxControl {
    fn default() -> Self {
        Self {
            check_cmd: vec!["nginx".to_string(), "-t".to_string()],
            reload_cmd: vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
        }
    }
}

impl NginxControl {
    async fn run(cmd: &[String]) -> Result<()> {
        let output = tokio::process::Command::new(&cmd[0])
            .args(&cmd[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| InstancerError::ProxyReloadFailed(format!("{:?}: {}", cmd, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InstancerError::ProxyReloadFailed(format!(
                "{:?} exited with {}: {}",
                cmd,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyControl for NginxControl {
    async fn check(&self) -> Result<()> {
        Self::run(&self.check_cmd).await
    }

    async fn reload(&self) -> Result<()> {
        Self::run(&self.reload_cmd).await
    }
}

pub struct ProxySynchronizer {
    sites_available: PathBuf,
    sites_enabled: PathBuf,
    template: String,
    control: Arc<dyn ProxyControl>,
    reload_tx: mpsc::Sender<()>,
    /// Serializes the fs mutation + paired check of each publish/retract.
    write_lock: Mutex<()>,
}

impl ProxySynchronizer {
    /// Create the synchronizer and spawn its reload coalescer. The template
    /// is read from `template_path` when present, otherwise the built-in
    /// contract is used.
    pub fn spawn(
        sites_available: &Path,
        sites_enabled: &Path,
        template_path: &Path,
        control: Arc<dyn ProxyControl>,
        debounce: Duration,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(sites_available)?;
        std::fs::create_dir_all(sites_enabled)?;

        let template = match std::fs::read_to_string(template_path) {
            Ok(text) => text,
            Err(_) => ROUTE_TEMPLATE.to_string(),
        };

        let (reload_tx, reload_rx) = mpsc::channel(16);
        let sync = Arc::new(Self {
            sites_available: sites_available.to_path_buf(),
            sites_enabled: sites_enabled.to_path_buf(),
            template,
            control: control.clone(),
            reload_tx,
            write_lock: Mutex::new(()),
        });
        tokio::spawn(coalesce_reloads(reload_rx, control, debounce));
        Ok(sync)
    }

    /// (Re)write the built-in template to its canonical path. Idempotent.
    pub fn write_canonical_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, ROUTE_TEMPLATE)?;
        info!("Route template written to {:?}", path);
        Ok(())
    }

    pub fn config_path(&self, hostname: &str) -> PathBuf {
        self.sites_available.join(format!("{}.conf", hostname))
    }

    fn link_path(&self, hostname: &str) -> PathBuf {
        self.sites_enabled.join(format!("{}.conf", hostname))
    }

    /// Render and publish one route: write the config, create the enabling
    /// link, dry-run check, then request a (coalesced) reload. On a failed
    /// check the just-written files are rolled back and `ProxyReloadFailed`
    /// is returned; other published records are untouched.
    pub async fn publish(&self, params: &RouteParams) -> Result<PathBuf> {
        let _guard = self.write_lock.lock().await;

        let rendered = template::render(&self.template, params)?;
        let conf = self.config_path(&params.hostname);
        let link = self.link_path(&params.hostname);

        let previous = std::fs::read(&conf).ok();
        let had_link = link.symlink_metadata().is_ok();

        std::fs::write(&conf, &rendered)?;
        remove_if_exists(&link)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&conf, &link)?;
        #[cfg(not(unix))]
        std::fs::copy(&conf, &link)?;

        if let Err(e) = self.control.check().await {
            warn!("Config check failed for {}, rolling back: {}", params.hostname, e);
            match &previous {
                Some(bytes) => {
                    std::fs::write(&conf, bytes)?;
                    if !had_link {
                        remove_if_exists(&link)?;
                    }
                }
                None => {
                    remove_if_exists(&link)?;
                    remove_if_exists(&conf)?;
                }
            }
            return Err(e);
        }

        self.request_reload();
        info!("Published route {} -> {}", params.hostname, params.target_address());
        Ok(conf)
    }

    /// Remove a route's config and enabling link, then request a reload.
    /// Fails with `UnknownHostname` if neither path exists.
    pub async fn retract(&self, hostname: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        // Also guards against path traversal through a crafted hostname.
        template::validate_hostname(hostname)?;

        let removed_link = remove_if_exists(&self.link_path(hostname))?;
        let removed_conf = remove_if_exists(&self.config_path(hostname))?;
        if !removed_link && !removed_conf {
            return Err(InstancerError::UnknownHostname(hostname.to_string()));
        }

        self.request_reload();
        info!("Retracted route {}", hostname);
        Ok(())
    }

    /// Immediate check + reload, bypassing the debounce. Used by the CLI
    /// where the exit code must reflect the reload outcome.
    pub async fn reload_now(&self) -> Result<()> {
        self.control.check().await?;
        self.control.reload().await
    }

    fn request_reload(&self) {
        // A full channel means a reload is already queued.
        let _ = self.reload_tx.try_send(());
    }
}

async fn coalesce_reloads(
    mut rx: mpsc::Receiver<()>,
    control: Arc<dyn ProxyControl>,
    debounce: Duration,
) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(debounce).await;
        // Fold every request that arrived during the window into one reload.
        while rx.try_recv().is_ok() {}
        match control.reload().await {
            Ok(()) => debug!("Proxy reloaded"),
            Err(e) => error!("Coalesced proxy reload failed: {}", e),
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockControl;
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn params(hostname: &str, port: u16) -> RouteParams {
        RouteParams {
            hostname: hostname.to_string(),
            container_ip: "10.0.0.5".to_string(),
            container_port: port,
            challenge_name: "pwn-101".to_string(),
            container_id: "abc123def4567890".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    fn synchronizer(
        dir: &TempDir,
        control: Arc<MockControl>,
        debounce: Duration,
    ) -> Arc<ProxySynchronizer> {
        ProxySynchronizer::spawn(
            &dir.path().join("sites-available"),
            &dir.path().join("sites-enabled"),
            &dir.path().join("route.conf.template"),
            control,
            debounce,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_writes_config_and_link() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(MockControl::default());
        let sync = synchronizer(&dir, control.clone(), Duration::from_millis(10));

        let conf = sync
            .publish(&params("pwn-101.challenges.local", 8080))
            .await
            .unwrap();

        let text = std::fs::read_to_string(&conf).unwrap();
        assert!(text.contains("proxy_pass http://10.0.0.5:8080/;"));
        assert!(dir
            .path()
            .join("sites-enabled/pwn-101.challenges.local.conf")
            .symlink_metadata()
            .is_ok());
        assert_eq!(control.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_check_rolls_back_new_record() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(MockControl::default());
        control.fail_check.store(true, Ordering::SeqCst);
        let sync = synchronizer(&dir, control.clone(), Duration::from_millis(10));

        let err = sync
            .publish(&params("pwn-101.challenges.local", 8080))
            .await
            .unwrap_err();
        assert!(matches!(err, InstancerError::ProxyReloadFailed(_)));

        assert!(!dir
            .path()
            .join("sites-available/pwn-101.challenges.local.conf")
            .exists());
        assert!(dir
            .path()
            .join("sites-enabled/pwn-101.challenges.local.conf")
            .symlink_metadata()
            .is_err());
        // No reload for a rolled-back record.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(control.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_check_restores_previous_config() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(MockControl::default());
        let sync = synchronizer(&dir, control.clone(), Duration::from_millis(10));

        let conf = sync
            .publish(&params("pwn-101.challenges.local", 8080))
            .await
            .unwrap();
        let original = std::fs::read_to_string(&conf).unwrap();

        control.fail_check.store(true, Ordering::SeqCst);
        let err = sync
            .publish(&params("pwn-101.challenges.local", 9999))
            .await
            .unwrap_err();
        assert!(matches!(err, InstancerError::ProxyReloadFailed(_)));

        // The earlier record survives the failed overwrite.
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), original);
        assert!(dir
            .path()
            .join("sites-enabled/pwn-101.challenges.local.conf")
            .symlink_metadata()
            .is_ok());
    }

    #[tokio::test]
    async fn test_retract_removes_both_paths() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(MockControl::default());
        let sync = synchronizer(&dir, control.clone(), Duration::from_millis(10));

        sync.publish(&params("pwn-101.challenges.local", 8080))
            .await
            .unwrap();
        sync.retract("pwn-101.challenges.local").await.unwrap();

        assert!(!dir
            .path()
            .join("sites-available/pwn-101.challenges.local.conf")
            .exists());
        assert!(dir
            .path()
            .join("sites-enabled/pwn-101.challenges.local.conf")
            .symlink_metadata()
            .is_err());
    }

    #[tokio::test]
    async fn test_retract_unknown_hostname() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(MockControl::default());
        let sync = synchronizer(&dir, control, Duration::from_millis(10));

        assert!(matches!(
            sync.retract("nope.challenges.local").await,
            Err(InstancerError::UnknownHostname(_))
        ));
    }

    #[tokio::test]
    async fn test_reloads_are_coalesced() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(MockControl::default());
        let sync = synchronizer(&dir, control.clone(), Duration::from_millis(80));

        sync.publish(&params("a.challenges.local", 8080)).await.unwrap();
        sync.publish(&params("b.challenges.local", 8081)).await.unwrap();
        sync.publish(&params("c.challenges.local", 8082)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(control.reloads.load(Ordering::SeqCst), 1);
        // Each write still completed before the shared reload.
        for host in ["a", "b", "c"] {
            assert!(dir
                .path()
                .join(format!("sites-available/{}.challenges.local.conf", host))
                .exists());
        }
    }

    #[tokio::test]
    async fn test_write_canonical_template_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instancer/route.conf.template");
        ProxySynchronizer::write_canonical_template(&path).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        ProxySynchronizer::write_canonical_template(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
        assert_eq!(first, ROUTE_TEMPLATE);
    }

    #[tokio::test]
    async fn test_reload_now_surfaces_failure() {
        let dir = TempDir::new().unwrap();
        let control = Arc::new(MockControl::default());
        control.fail_check.store(true, Ordering::SeqCst);
        let sync = synchronizer(&dir, control, Duration::from_millis(10));

        assert!(matches!(
            sync.reload_now().await,
            Err(InstancerError::ProxyReloadFailed(_))
        ));
    }
}
