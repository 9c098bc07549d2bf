//! One-shot subcommands: scaffolding, validation and offline replays.

use std::path::Path;

use anyhow::{Context, bail};
use fleet_balancer::LoadBalancer;
use fleet_core::{FleetConfig, Level, WorkloadSettings};
use fleet_feedback::{LoadCalibrator, LoadPredictor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

const SAMPLE_CONTROLLERS: &str = r#"# Per-metric band tables: [level, upper, lower].
# Bands may overlap; the overlap is the hysteresis margin.

[controllers.cpu]
initial_level = 0
bands = [
    [0, 10, 0],
    [1, 20, 9],
    [2, 30, 19],
    [3, 40, 29],
    [4, 50, 38],
    [5, 60, 48],
    [6, 70, 57],
    [7, 80, 67],
    [8, 90, 77],
    [9, 9223372036854775807, 77],
]
"#;

pub fn init(dir: &Path, force: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))?;

    let config = FleetConfig::scaffold(dir);
    let files = [
        (dir.join("fleetd.toml"), config.to_toml_string()?),
        (
            config.workload_file.clone(),
            WorkloadSettings::default().to_toml_string()?,
        ),
        (dir.join("controllers.toml"), SAMPLE_CONTROLLERS.to_string()),
    ];

    for (path, content) in files {
        if path.exists() && !force {
            println!("skipped {} (exists, use --force to overwrite)", path.display());
            continue;
        }
        std::fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

pub fn check_workload(path: &Path) -> anyhow::Result<()> {
    let settings = WorkloadSettings::from_file(path)
        .with_context(|| format!("invalid workload file: {}", path.display()))?;

    println!("{}: ok", path.display());
    for level in Level::ALL {
        println!("  {:<7} weight {}", level.to_string(), settings.weight(level));
    }
    println!("  priority up at   {}", settings.priority_up_threshold);
    println!("  priority down at {}", settings.priority_down_threshold);
    println!("  reserve ratio    {}", settings.reserve_ratio);
    Ok(())
}

pub fn predict(calibration: &Path, metric: &str, values: &[i64]) -> anyhow::Result<()> {
    let Some(calibrator) = LoadCalibrator::load_from_path(calibration)? else {
        bail!("no calibration at {}", calibration.display());
    };
    let Some(table) = calibrator.table(metric) else {
        let known: Vec<&str> = calibrator.metrics().collect();
        bail!("metric {metric:?} not calibrated (known: {})", known.join(", "));
    };

    let mut predictor = LoadPredictor::new(metric, Level::LOWEST, table.clone());
    for value in values {
        println!("{metric}={value} -> {}", predictor.set_peer_count(*value));
    }
    Ok(())
}

pub fn simulate(
    workload: Option<&Path>,
    servers: usize,
    tiers: u8,
    draws: u32,
    seed: u64,
    json: bool,
) -> anyhow::Result<()> {
    let settings = match workload {
        Some(path) => WorkloadSettings::from_file(path)
            .with_context(|| format!("load workload file: {}", path.display()))?,
        None => WorkloadSettings::default(),
    };
    let tiers = tiers.max(1);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut lb = LoadBalancer::new(settings);
    for i in 0..servers {
        let level = Level::ALL[rng.random_range(0..Level::ALL.len())];
        lb.try_add_server(format!("server-{i}"), level, (i % usize::from(tiers)) as u8)?;
    }
    info!(
        servers,
        tiers,
        admitted = lb.admitted_priority(),
        average = %lb.average_workload(),
        "synthetic fleet ready"
    );

    let mut picks = std::collections::BTreeMap::new();
    let mut misses = 0u32;
    for _ in 0..draws {
        match lb.try_get_server_with(&mut rng, |_| true) {
            Some(handle) => *picks.entry(handle).or_insert(0u32) += 1,
            None => misses += 1,
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&lb.server_states())?);
        return Ok(());
    }

    println!(
        "{:<12} {:>8} {:>4} {:>9} {:>8}",
        "SERVER", "LEVEL", "TIER", "RESERVE", "PICKS"
    );
    for state in lb.server_states() {
        let reserve = match (state.is_reserved, state.is_in_reserve) {
            (true, true) => "held",
            (true, false) => "pulled",
            _ => "-",
        };
        println!(
            "{:<12} {:>8} {:>4} {:>9} {:>8}",
            state.handle,
            state.level.to_string(),
            state.priority,
            reserve,
            picks.get(&state.handle).copied().unwrap_or(0)
        );
    }
    println!(
        "admitted tiers 0..={}, average {}, available average {}, misses {misses}",
        lb.admitted_priority(),
        lb.average_workload(),
        lb.average_workload_for_available_servers()
    );
    Ok(())
}
