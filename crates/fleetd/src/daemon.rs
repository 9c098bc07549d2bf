//! `fleetd run`: assemble the core, feed it worker reports from stdin and
//! keep it alive until ctrl-c.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use fleet_balancer::{LoadBalancer, WorkloadWatcher};
use fleet_core::config::{CalibrationConfig, load_controller_thresholds};
use fleet_core::{ControllerThresholds, FleetConfig, WorkloadSettings};
use fleet_feedback::{LoadCalibrator, SharedCalibrator, TableHandle, spawn_autosave};
use tokio::io::BufReader;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::feed::{Calibration, Fleet, run_feed};

pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "fleet daemon starting");

    let config = FleetConfig::from_file(config_path)
        .with_context(|| format!("load daemon config: {}", config_path.display()))?;
    let watch_interval = config.watch_interval()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ── Core state ─────────────────────────────────────────────

    let settings = WorkloadSettings::from_file(&config.workload_file)
        .with_context(|| format!("load workload file: {}", config.workload_file.display()))?;
    let settings = Arc::new(ArcSwap::from_pointee(settings));
    let balancer = LoadBalancer::with_settings_handle(settings.clone());
    info!(workload = %config.workload_file.display(), "load balancer initialized");

    let thresholds = match &config.controllers_file {
        Some(path) => load_thresholds(path)?,
        None => BTreeMap::new(),
    };

    let calibration = match &config.calibration {
        Some(calibration) => {
            let calibrator: SharedCalibrator = Arc::new(Mutex::new(restore_calibrator(calibration)?));
            tasks.push(spawn_autosave(
                calibrator.clone(),
                calibration.state_file.clone(),
                calibration.autosave_interval()?,
                shutdown_rx.clone(),
            ));
            Some(Calibration::new(calibrator, calibration.metric.clone()).await)
        }
        None => None,
    };

    let fleet = Fleet::new(balancer, thresholds, calibration);
    let table_handles = fleet.table_handles();
    let fleet = Arc::new(Mutex::new(fleet));

    // ── Background tasks ───────────────────────────────────────

    let watcher = WorkloadWatcher::new(&config.workload_file, settings);
    let reloads = watcher.subscribe();
    tasks.push(watcher.spawn(watch_interval, shutdown_rx.clone()));
    tasks.push(spawn_refresh(fleet.clone(), reloads, shutdown_rx.clone()));

    if let Some(path) = config.controllers_file.clone() {
        tasks.push(spawn_controllers_reload(
            path,
            table_handles,
            watch_interval,
            shutdown_rx.clone(),
        ));
    }

    // Reading stdin blocks a runtime thread that cannot be cancelled, so
    // the feed task is aborted rather than joined.
    let feed = {
        let fleet = fleet.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let input = BufReader::new(tokio::io::stdin());
            if let Err(e) = run_feed(&fleet, input, tokio::io::stdout(), shutdown).await {
                error!(error = %e, "feed stopped");
            }
        })
    };
    info!("reading worker reports from stdin");

    // ── Wait for shutdown ──────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("install ctrl-c handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    feed.abort();
    for task in tasks {
        let _ = task.await;
    }

    let fleet = fleet.lock().await;
    let lb = fleet.balancer();
    info!(servers = lb.len(), average = %lb.average_workload(), "fleet daemon stopped");
    Ok(())
}

fn load_thresholds(path: &Path) -> anyhow::Result<BTreeMap<String, ControllerThresholds>> {
    let thresholds = load_controller_thresholds(path)
        .with_context(|| format!("load controllers file: {}", path.display()))?;
    for (metric, t) in &thresholds {
        info!(metric = %metric, initial = %t.initial_level, bands = t.table.len(), "feedback controller configured");
    }
    Ok(thresholds)
}

/// Load the saved calibration, or start empty. The configured factor wins
/// over a persisted one.
fn restore_calibrator(config: &CalibrationConfig) -> anyhow::Result<LoadCalibrator> {
    let path = &config.state_file;
    let Some(mut calibrator) = LoadCalibrator::load_from_path(path)? else {
        info!(path = %path.display(), "no saved calibration, starting empty");
        return Ok(LoadCalibrator::new(config.factor)?);
    };
    if calibrator.factor() != config.factor {
        warn!(
            path = %path.display(),
            saved = calibrator.factor(),
            configured = config.factor,
            "saved calibration factor differs, using the configured one"
        );
        calibrator.set_factor(config.factor)?;
    }
    info!(path = %path.display(), metrics = calibrator.metrics().count(), "calibration restored");
    Ok(calibrator)
}

/// Re-apply settings to every tier after each workload reload.
fn spawn_refresh(
    fleet: Arc<Mutex<Fleet>>,
    mut reloads: watch::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = reloads.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let generation = *reloads.borrow_and_update();
                    fleet.lock().await.refresh();
                    debug!(generation, "balancer refreshed after reload");
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Poll the controllers file and publish changed band tables to every
/// server's controllers.
fn spawn_controllers_reload(
    path: PathBuf,
    tables: BTreeMap<String, TableHandle>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Compared by content: a rewrite can keep the size and mtime.
        let mut last_seen = std::fs::read_to_string(&path).ok();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = std::fs::read_to_string(&path).ok();
                    if current.is_none() || current == last_seen {
                        continue;
                    }
                    last_seen = current;
                    publish_thresholds(&path, &tables);
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn publish_thresholds(path: &Path, tables: &BTreeMap<String, TableHandle>) {
    let thresholds = match load_controller_thresholds(path) {
        Ok(thresholds) => thresholds,
        Err(e) => {
            error!(path = %path.display(), error = %e, "controllers reload failed, keeping previous bands");
            return;
        }
    };
    for (metric, t) in thresholds {
        match tables.get(&metric) {
            Some(table) => {
                table.publish(t.table);
                info!(metric = %metric, "controller bands reloaded");
            }
            None => warn!(metric = %metric, "new metric in controllers file ignored until restart"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{BandTable, Level};

    fn calibration_config(dir: &Path, factor: f64) -> CalibrationConfig {
        CalibrationConfig {
            state_file: dir.join("calibration.json"),
            factor,
            metric: "peers".to_string(),
            autosave_interval: "30s".to_string(),
        }
    }

    #[test]
    fn configured_factor_overrides_saved_one() {
        let dir = tempfile::tempdir().unwrap();
        let config = calibration_config(dir.path(), 0.25);

        let fresh = restore_calibrator(&config).unwrap();
        assert_eq!(fresh.factor(), 0.25);
        assert_eq!(fresh.metrics().count(), 0);

        let mut saved = LoadCalibrator::new(2.0).unwrap();
        saved.update_prediction("peers", 40, Level::Level3);
        saved.save_to_path(&config.state_file).unwrap();

        let restored = restore_calibrator(&config).unwrap();
        assert_eq!(restored.factor(), 0.25);
        assert_eq!(restored.table("peers"), saved.table("peers"));
    }

    #[test]
    fn reloaded_bands_reach_shared_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controllers.toml");
        std::fs::write(
            &path,
            "[controllers.cpu]\ninitial_level = 0\nbands = [[0, 10, 0], [9, 9223372036854775807, 8]]\n",
        )
        .unwrap();

        let cpu = TableHandle::new(BandTable::new());
        let tables = BTreeMap::from([("cpu".to_string(), cpu.clone())]);
        publish_thresholds(&path, &tables);
        assert_eq!(cpu.snapshot().len(), 2);

        std::fs::write(&path, "[controllers.cpu]\nbands = [[0, 1, 5]]\n").unwrap();
        publish_thresholds(&path, &tables);
        assert_eq!(cpu.snapshot().len(), 2, "bad file must keep previous bands");
    }
}
