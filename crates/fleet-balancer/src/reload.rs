//! Hot reload of the workload file.
//!
//! File events from `notify` trigger an immediate re-read; a polling
//! interval catches anything the event source misses (or stands in for it
//! entirely when no watcher can be set up). Each reload parses the whole
//! file and publishes a complete `WorkloadSettings` through the shared
//! `ArcSwap`. A bad file never replaces good settings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{ConfigError, ConfigResult, WorkloadSettings};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::balancer::SettingsHandle;

/// Watches a workload file and publishes its settings.
pub struct WorkloadWatcher {
    path: PathBuf,
    settings: SettingsHandle,
    /// File content as of the last read, good or bad.
    last_seen: Option<String>,
    reloads: watch::Sender<u64>,
}

impl WorkloadWatcher {
    pub fn new(path: impl Into<PathBuf>, settings: SettingsHandle) -> Self {
        let (reloads, _) = watch::channel(0);
        Self {
            path: path.into(),
            settings,
            last_seen: None,
            reloads,
        }
    }

    /// File this watcher reads.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receiver bumped once per applied reload.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.reloads.subscribe()
    }

    /// Read and apply the file now. Returns whether the published settings
    /// changed. On error the previous settings stay in effect.
    pub fn reload_now(&mut self) -> ConfigResult<bool> {
        match self.read() {
            Ok(content) => self.apply(content),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "workload reload failed, keeping previous settings");
                Err(e)
            }
        }
    }

    /// Apply the file if its content differs from the last read. Used by
    /// the polling path, where metadata alone can miss a rewrite.
    pub fn reload_if_changed(&mut self) {
        let content = match self.read() {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "workload file not readable");
                return;
            }
        };
        if self.last_seen.as_deref() == Some(content.as_str()) {
            return;
        }
        // Errors are already logged and the previous settings stay.
        let _ = self.apply(content);
    }

    fn read(&self) -> ConfigResult<String> {
        std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn apply(&mut self, content: String) -> ConfigResult<bool> {
        let parsed = WorkloadSettings::from_toml_str(&content);
        self.last_seen = Some(content);
        let settings = match parsed {
            Ok(settings) => settings,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "workload reload failed, keeping previous settings");
                return Err(e);
            }
        };

        if *self.settings.load_full() == settings {
            debug!(path = %self.path.display(), "workload file unchanged");
            return Ok(false);
        }

        info!(
            path = %self.path.display(),
            weights = ?settings.weights,
            up = %settings.priority_up_threshold,
            down = %settings.priority_down_threshold,
            reserve_ratio = settings.reserve_ratio,
            "workload settings reloaded"
        );
        self.settings.store(Arc::new(settings));
        self.reloads.send_modify(|generation| *generation += 1);
        Ok(true)
    }

    /// Run the watch loop on the tokio runtime until `shutdown` changes.
    pub fn spawn(self, poll_interval: Duration, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(poll_interval, shutdown))
    }

    async fn run(mut self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        // Held for the lifetime of the loop; dropping it stops the events.
        let _watcher = match self.setup_filesystem_watcher(event_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "file watcher unavailable, polling only");
                None
            }
        };

        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(path = %self.path.display(), ?poll_interval, "workload watcher started");

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    if self.concerns_us(&event) {
                        debug!(kind = ?event.kind, "workload file event");
                        // Errors are already logged and the previous settings stay.
                        let _ = self.reload_now();
                    }
                }
                _ = poll.tick() => {
                    self.reload_if_changed();
                }
                _ = shutdown.changed() => {
                    debug!("workload watcher shutting down");
                    break;
                }
            }
        }
    }

    fn setup_filesystem_watcher(
        &self,
        events: mpsc::UnboundedSender<Event>,
    ) -> notify::Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                // Receiver gone means the loop has stopped.
                Ok(event) => {
                    let _ = events.send(event);
                }
                Err(e) => error!(error = %e, "file watch error"),
            },
            Config::default(),
        )?;

        // Watch the directory: editors and deploy tools often replace the
        // file by rename.
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    fn concerns_us(&self, event: &Event) -> bool {
        let name = self.path.file_name();
        event.paths.iter().any(|p| p.file_name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_swap::ArcSwap;
    use fleet_core::{ConfigError, Level};

    const BALANCED: &str = "weights = [50, 40, 30, 25, 20, 15, 10, 5, 1, 0]\n";
    const FLAT: &str = r#"
weights = [10, 10, 10, 10, 10, 10, 10, 10, 10, 10]
priority_up_threshold = 8
priority_down_threshold = 2
reserve_ratio = 0.25
"#;

    fn handle() -> SettingsHandle {
        Arc::new(ArcSwap::from_pointee(WorkloadSettings::default()))
    }

    #[test]
    fn reload_publishes_new_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workload.toml");
        std::fs::write(&path, FLAT).unwrap();

        let settings = handle();
        let mut watcher = WorkloadWatcher::new(&path, settings.clone());
        let reloads = watcher.subscribe();

        assert!(watcher.reload_now().unwrap());
        let current = settings.load();
        assert_eq!(current.weights, [10; 10]);
        assert_eq!(current.priority_up_threshold, Level::Level8);
        assert_eq!(current.reserve_ratio, 0.25);
        assert_eq!(*reloads.borrow(), 1);

        // Same content again: nothing published.
        assert!(!watcher.reload_now().unwrap());
        assert_eq!(*reloads.borrow(), 1);
    }

    #[test]
    fn bad_file_keeps_previous_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workload.toml");
        std::fs::write(&path, FLAT).unwrap();

        let settings = handle();
        let mut watcher = WorkloadWatcher::new(&path, settings.clone());
        watcher.reload_now().unwrap();

        std::fs::write(&path, "weights = [1, 2, 3]\n").unwrap();
        assert!(matches!(
            watcher.reload_now(),
            Err(ConfigError::WeightsLength { expected: 10, found: 3 })
        ));
        assert_eq!(settings.load().weights, [10; 10]);

        std::fs::write(&path, "weights = [oops").unwrap();
        assert!(matches!(watcher.reload_now(), Err(ConfigError::Parse(_))));
        assert_eq!(settings.load().weights, [10; 10]);

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(watcher.reload_now(), Err(ConfigError::Io { .. })));
        assert_eq!(settings.load().reserve_ratio, 0.25);
    }

    #[test]
    fn same_length_rewrite_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workload.toml");
        std::fs::write(&path, "weights = [10, 10, 10, 10, 10, 10, 10, 10, 10, 10]\n").unwrap();

        let settings = handle();
        let mut watcher = WorkloadWatcher::new(&path, settings.clone());
        watcher.reload_now().unwrap();
        let stamp = std::fs::metadata(&path).unwrap().modified().unwrap();

        std::fs::write(&path, "weights = [20, 20, 20, 20, 20, 20, 20, 20, 20, 20]\n").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(stamp)
            .unwrap();

        watcher.reload_if_changed();
        assert_eq!(settings.load().weights, [20; 10]);
    }

    #[test]
    fn unchanged_bad_file_is_not_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workload.toml");
        std::fs::write(&path, FLAT).unwrap();

        let settings = handle();
        let mut watcher = WorkloadWatcher::new(&path, settings.clone());
        let reloads = watcher.subscribe();
        watcher.reload_if_changed();
        assert_eq!(*reloads.borrow(), 1);

        std::fs::write(&path, "weights = [oops").unwrap();
        watcher.reload_if_changed();
        watcher.reload_if_changed();
        assert_eq!(settings.load().weights, [10; 10]);

        std::fs::write(&path, BALANCED).unwrap();
        watcher.reload_if_changed();
        assert_eq!(settings.load().weights, [50, 40, 30, 25, 20, 15, 10, 5, 1, 0]);
        assert_eq!(*reloads.borrow(), 2);
    }

    #[tokio::test]
    async fn watch_loop_picks_up_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workload.toml");
        std::fs::write(&path, BALANCED).unwrap();

        let settings = handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = WorkloadWatcher::new(&path, settings.clone())
            .spawn(Duration::from_millis(20), shutdown_rx);

        std::fs::write(&path, FLAT).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while settings.load().weights != [10; 10] {
            assert!(tokio::time::Instant::now() < deadline, "reload not observed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
