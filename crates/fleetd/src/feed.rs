//! Line feed that drives the core from worker reports.
//!
//! Each input line is one command:
//!
//! ```text
//! add <server> <priority> [weight]
//! remove <server>
//! state <server> normal|out-of-rotation|offline
//! move <server> <priority>
//! sample <server> <metric> <value>
//! peers <server> <count>
//! pick [prefix]
//! status
//! ```
//!
//! `sample` runs the server's feedback controller for the metric and reports
//! the highest level across its metrics. `peers` runs the load predictor and
//! reports the predicted level until the next sample. With calibration on,
//! each sample also tells the calibrator what level the server's last peer
//! count really meant; a refined table reaches every predictor at once.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use anyhow::{Context, anyhow, bail};
use fleet_balancer::{DEFAULT_SERVER_WEIGHT, LoadBalancer};
use fleet_core::{ControllerThresholds, Level, ServerState};
use fleet_feedback::{FeedbackController, LoadPredictor, SharedCalibrator, TableHandle};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Add {
        server: String,
        priority: u8,
        weight: u32,
    },
    Remove {
        server: String,
    },
    State {
        server: String,
        state: ServerState,
    },
    Move {
        server: String,
        priority: u8,
    },
    Sample {
        server: String,
        metric: String,
        value: i64,
    },
    Peers {
        server: String,
        count: i64,
    },
    Pick {
        prefix: Option<String>,
    },
    Status,
}

impl FromStr for FeedCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> anyhow::Result<Self> {
        let mut args = line.split_whitespace();
        let command = args.next().ok_or_else(|| anyhow!("empty command"))?;
        let parsed = match command {
            "add" => FeedCommand::Add {
                server: next(&mut args, "server")?.to_string(),
                priority: number(&mut args, "priority")?,
                weight: match args.next() {
                    Some(raw) => parse(raw, "weight")?,
                    None => DEFAULT_SERVER_WEIGHT,
                },
            },
            "remove" => FeedCommand::Remove {
                server: next(&mut args, "server")?.to_string(),
            },
            "state" => {
                let server = next(&mut args, "server")?.to_string();
                let raw = next(&mut args, "state")?;
                let state = ServerState::from_label(raw)
                    .ok_or_else(|| anyhow!("invalid state: {raw:?}"))?;
                FeedCommand::State { server, state }
            }
            "move" => FeedCommand::Move {
                server: next(&mut args, "server")?.to_string(),
                priority: number(&mut args, "priority")?,
            },
            "sample" => FeedCommand::Sample {
                server: next(&mut args, "server")?.to_string(),
                metric: next(&mut args, "metric")?.to_string(),
                value: number(&mut args, "value")?,
            },
            "peers" => FeedCommand::Peers {
                server: next(&mut args, "server")?.to_string(),
                count: number(&mut args, "count")?,
            },
            "pick" => FeedCommand::Pick {
                prefix: args.next().map(str::to_string),
            },
            "status" => FeedCommand::Status,
            other => bail!("unknown command {other:?}"),
        };
        if let Some(extra) = args.next() {
            bail!("unexpected argument {extra:?} to {command}");
        }
        Ok(parsed)
    }
}

fn next<'a>(args: &mut impl Iterator<Item = &'a str>, name: &str) -> anyhow::Result<&'a str> {
    args.next().ok_or_else(|| anyhow!("missing {name}"))
}

fn number<'a, N>(args: &mut impl Iterator<Item = &'a str>, name: &str) -> anyhow::Result<N>
where
    N: FromStr,
    N::Err: std::error::Error + Send + Sync + 'static,
{
    parse(next(args, name)?, name)
}

fn parse<N>(raw: &str, name: &str) -> anyhow::Result<N>
where
    N: FromStr,
    N::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse().with_context(|| format!("invalid {name}: {raw:?}"))
}

/// The shared calibrator and the prediction table every predictor reads.
pub struct Calibration {
    calibrator: SharedCalibrator,
    metric: String,
    table: TableHandle,
}

impl Calibration {
    pub async fn new(calibrator: SharedCalibrator, metric: impl Into<String>) -> Self {
        let metric = metric.into();
        let table = calibrator
            .lock()
            .await
            .table(&metric)
            .cloned()
            .unwrap_or_default();
        Self {
            calibrator,
            metric,
            table: TableHandle::new(table),
        }
    }

    async fn learn(&self, peers: i64, observed: Level) {
        let updated = self
            .calibrator
            .lock()
            .await
            .update_prediction(&self.metric, peers, observed);
        if let Some(table) = updated {
            debug!(metric = %self.metric, bands = table.len(), "prediction table published");
            self.table.publish(table);
        }
    }
}

struct MetricSource {
    initial: Level,
    table: TableHandle,
}

/// Per-server feedback state.
struct ServerFeed {
    controllers: BTreeMap<String, FeedbackController>,
    predictor: Option<LoadPredictor>,
    state: ServerState,
    level: Level,
}

/// Controllers, predictors and the balancer, fed one command at a time.
pub struct Fleet {
    balancer: LoadBalancer<String>,
    metrics: BTreeMap<String, MetricSource>,
    calibration: Option<Calibration>,
    servers: HashMap<String, ServerFeed>,
}

impl Fleet {
    pub fn new(
        balancer: LoadBalancer<String>,
        thresholds: BTreeMap<String, ControllerThresholds>,
        calibration: Option<Calibration>,
    ) -> Self {
        let metrics = thresholds
            .into_iter()
            .map(|(metric, t)| {
                let source = MetricSource {
                    initial: t.initial_level,
                    table: TableHandle::new(t.table),
                };
                (metric, source)
            })
            .collect();
        Self {
            balancer,
            metrics,
            calibration,
            servers: HashMap::new(),
        }
    }

    /// Band tables shared by every server's controller, keyed by metric.
    /// Publishing through one reaches all servers.
    pub fn table_handles(&self) -> BTreeMap<String, TableHandle> {
        self.metrics
            .iter()
            .map(|(metric, source)| (metric.clone(), source.table.clone()))
            .collect()
    }

    pub fn balancer(&self) -> &LoadBalancer<String> {
        &self.balancer
    }

    /// Re-apply the current workload settings to the balancer.
    pub fn refresh(&mut self) {
        self.balancer.refresh();
    }

    /// Apply one command. Returns the reply line, if the command has one.
    pub async fn apply(&mut self, command: FeedCommand) -> anyhow::Result<Option<String>> {
        debug!(?command, "feed command");
        match command {
            FeedCommand::Add {
                server,
                priority,
                weight,
            } => {
                self.balancer
                    .try_add_server_weighted(server.clone(), Level::LOWEST, priority, weight)?;
                let feed = self.new_server_feed();
                self.servers.insert(server, feed);
            }
            FeedCommand::Remove { server } => {
                self.balancer.try_remove_server(&server, None)?;
                self.servers.remove(&server);
            }
            FeedCommand::State { server, state } => {
                let feed = feed_mut(&mut self.servers, &server)?;
                let priority = priority_of(&self.balancer, &server)?;
                self.balancer
                    .try_update_server(&server, feed.level, priority, state)?;
                feed.state = state;
            }
            FeedCommand::Move { server, priority } => {
                let feed = feed_mut(&mut self.servers, &server)?;
                self.balancer
                    .try_update_server(&server, feed.level, priority, feed.state)?;
            }
            FeedCommand::Sample {
                server,
                metric,
                value,
            } => {
                let feed = feed_mut(&mut self.servers, &server)?;
                let controller = feed
                    .controllers
                    .get_mut(&metric)
                    .ok_or_else(|| anyhow!("no controller for metric {metric:?}"))?;
                controller.set_input(value);
                let measured = feed
                    .controllers
                    .values()
                    .map(FeedbackController::output)
                    .max()
                    .unwrap_or(Level::LOWEST);

                let peers = feed.predictor.as_ref().and_then(LoadPredictor::peer_count);
                if let (Some(calibration), Some(peers)) = (&self.calibration, peers) {
                    calibration.learn(peers, measured).await;
                }
                report(&mut self.balancer, &server, feed, measured)?;
            }
            FeedCommand::Peers { server, count } => {
                let feed = feed_mut(&mut self.servers, &server)?;
                let Some(predictor) = feed.predictor.as_mut() else {
                    bail!("calibration disabled, peer counts are not used");
                };
                let predicted = predictor.set_peer_count(count);
                if predictor.prediction_levels().is_empty() {
                    debug!(server = %server, count, "no prediction table yet");
                    return Ok(None);
                }
                report(&mut self.balancer, &server, feed, predicted)?;
            }
            FeedCommand::Pick { prefix } => {
                let picked = match &prefix {
                    Some(prefix) => self
                        .balancer
                        .try_get_server_filtered(|h| h.starts_with(prefix.as_str())),
                    None => self.balancer.try_get_server(),
                };
                return Ok(Some(format!("pick {}", picked.as_deref().unwrap_or("-"))));
            }
            FeedCommand::Status => {
                return Ok(Some(serde_json::to_string(&self.balancer.server_states())?));
            }
        }
        Ok(None)
    }

    fn new_server_feed(&self) -> ServerFeed {
        let controllers = self
            .metrics
            .iter()
            .map(|(metric, source)| {
                let controller = FeedbackController::with_table_handle(
                    metric.clone(),
                    source.initial,
                    source.table.clone(),
                );
                (metric.clone(), controller)
            })
            .collect();
        let predictor = self.calibration.as_ref().map(|c| {
            LoadPredictor::with_table_handle(c.metric.clone(), Level::LOWEST, c.table.clone())
        });
        ServerFeed {
            controllers,
            predictor,
            state: ServerState::Normal,
            level: Level::LOWEST,
        }
    }
}

fn feed_mut<'a>(
    servers: &'a mut HashMap<String, ServerFeed>,
    server: &str,
) -> anyhow::Result<&'a mut ServerFeed> {
    servers
        .get_mut(server)
        .ok_or_else(|| anyhow!("unknown server {server:?}"))
}

fn priority_of(balancer: &LoadBalancer<String>, server: &String) -> anyhow::Result<u8> {
    balancer
        .priority_of(server)
        .ok_or_else(|| anyhow!("unknown server {server:?}"))
}

fn report(
    balancer: &mut LoadBalancer<String>,
    server: &String,
    feed: &mut ServerFeed,
    level: Level,
) -> anyhow::Result<()> {
    let priority = priority_of(balancer, server)?;
    balancer.try_update_server(server, level, priority, feed.state)?;
    feed.level = level;
    Ok(())
}

/// Apply commands line by line until the input ends or shutdown is
/// signalled. Replies go to `out`, one per line. A failed command replies
/// `error: ...` and the feed carries on.
pub async fn run_feed<R, W>(
    fleet: &Mutex<Fleet>,
    input: R,
    mut out: W,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("read feed")?,
            _ = shutdown.changed() => break,
        };
        let Some(line) = line else {
            info!("feed input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let reply = match line.parse::<FeedCommand>() {
            Ok(command) => fleet.lock().await.apply(command).await,
            Err(e) => Err(e),
        };
        let reply = match reply {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(e) => {
                warn!(line, error = %e, "feed command failed");
                format!("error: {e:#}")
            }
        };
        out.write_all(reply.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleet_core::{BandTable, WorkloadSettings};
    use fleet_feedback::LoadCalibrator;
    use Level::*;

    fn cpu_thresholds() -> BTreeMap<String, ControllerThresholds> {
        let table = BandTable::from_triples([
            (Level0, 10, 0),
            (Level2, 30, 9),
            (Level5, 60, 28),
            (Level8, 90, 57),
            (Level9, i64::MAX, 87),
        ])
        .unwrap();
        BTreeMap::from([(
            "cpu".to_string(),
            ControllerThresholds {
                initial_level: Level0,
                table,
            },
        )])
    }

    fn fleet(calibration: Option<Calibration>) -> Fleet {
        Fleet::new(
            LoadBalancer::new(WorkloadSettings::default()),
            cpu_thresholds(),
            calibration,
        )
    }

    fn level_of(fleet: &Fleet, server: &str) -> Level {
        fleet
            .balancer()
            .server_states()
            .into_iter()
            .find(|s| s.handle == server)
            .map(|s| s.level)
            .unwrap()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            "add eu-1 2".parse::<FeedCommand>().unwrap(),
            FeedCommand::Add {
                server: "eu-1".into(),
                priority: 2,
                weight: DEFAULT_SERVER_WEIGHT
            }
        );
        assert_eq!(
            "add eu-1 0 3".parse::<FeedCommand>().unwrap(),
            FeedCommand::Add {
                server: "eu-1".into(),
                priority: 0,
                weight: 3
            }
        );
        assert_eq!(
            "state eu-1 out-of-rotation".parse::<FeedCommand>().unwrap(),
            FeedCommand::State {
                server: "eu-1".into(),
                state: ServerState::OutOfRotation
            }
        );
        assert_eq!(
            "sample eu-1 cpu -5".parse::<FeedCommand>().unwrap(),
            FeedCommand::Sample {
                server: "eu-1".into(),
                metric: "cpu".into(),
                value: -5
            }
        );
        assert_eq!(
            "pick eu-".parse::<FeedCommand>().unwrap(),
            FeedCommand::Pick {
                prefix: Some("eu-".into())
            }
        );
        assert_eq!("status".parse::<FeedCommand>().unwrap(), FeedCommand::Status);
    }

    #[test]
    fn rejects_malformed_commands() {
        for line in [
            "",
            "launch eu-1",
            "add eu-1",
            "add eu-1 300",
            "state eu-1 draining",
            "sample eu-1 cpu lots",
            "remove eu-1 now",
        ] {
            assert!(line.parse::<FeedCommand>().is_err(), "{line:?} parsed");
        }
    }

    #[tokio::test]
    async fn samples_drive_levels_and_selection() {
        let mut fleet = fleet(None);
        for line in ["add a 0", "add b 0"] {
            fleet.apply(line.parse().unwrap()).await.unwrap();
        }

        fleet.apply("sample a cpu 95".parse().unwrap()).await.unwrap();
        assert_eq!(level_of(&fleet, "a"), Level9);

        // Saturated servers carry no weight.
        for _ in 0..50 {
            let reply = fleet.apply(FeedCommand::Pick { prefix: None }).await.unwrap();
            assert_eq!(reply.as_deref(), Some("pick b"));
        }

        fleet.apply("sample a cpu 40".parse().unwrap()).await.unwrap();
        assert_eq!(level_of(&fleet, "a"), Level5);

        assert!(fleet.apply("sample a disk 1".parse().unwrap()).await.is_err());
        assert!(fleet.apply("sample zz cpu 1".parse().unwrap()).await.is_err());
        assert!(fleet.apply("peers a 10".parse().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn state_and_move_keep_reported_level() {
        let mut fleet = fleet(None);
        fleet.apply("add a 0".parse().unwrap()).await.unwrap();
        fleet.apply("sample a cpu 40".parse().unwrap()).await.unwrap();

        fleet.apply("move a 2".parse().unwrap()).await.unwrap();
        assert_eq!(fleet.balancer().priority_of(&"a".to_string()), Some(2));
        assert_eq!(level_of(&fleet, "a"), Level5);

        fleet.apply("state a offline".parse().unwrap()).await.unwrap();
        let reply = fleet.apply(FeedCommand::Pick { prefix: None }).await.unwrap();
        assert_eq!(reply.as_deref(), Some("pick -"));

        // A later sample keeps the server offline.
        fleet.apply("sample a cpu 5".parse().unwrap()).await.unwrap();
        let states = fleet.balancer().server_states();
        assert_eq!(states[0].state, ServerState::Offline);

        fleet.apply("remove a".parse().unwrap()).await.unwrap();
        assert!(fleet.balancer().is_empty());
        assert!(fleet.apply("remove a".parse().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn samples_calibrate_predictors() {
        let calibrator: SharedCalibrator = Arc::new(Mutex::new(LoadCalibrator::new(1.0).unwrap()));
        let calibration = Calibration::new(calibrator.clone(), "peers").await;
        let mut fleet = fleet(Some(calibration));
        fleet.apply("add a 0".parse().unwrap()).await.unwrap();

        // No table yet: the peer count is remembered but reports nothing.
        fleet.apply("peers a 40".parse().unwrap()).await.unwrap();
        assert_eq!(level_of(&fleet, "a"), Level0);

        // The sample says 40 peers meant Level5.
        fleet.apply("sample a cpu 40".parse().unwrap()).await.unwrap();
        assert_eq!(level_of(&fleet, "a"), Level5);
        let table = calibrator.lock().await.table("peers").cloned().unwrap();
        assert_eq!(table.get(Level5).map(|b| (b.upper, b.lower)), Some((40, 40)));

        // A second server shares the published table.
        fleet.apply("add b 0".parse().unwrap()).await.unwrap();
        fleet.apply("peers b 40".parse().unwrap()).await.unwrap();
        assert_eq!(level_of(&fleet, "b"), Level5);
        fleet.apply("peers b 10".parse().unwrap()).await.unwrap();
        assert_eq!(level_of(&fleet, "b"), Level0);
    }

    #[tokio::test]
    async fn feed_replies_line_by_line() {
        let fleet = Mutex::new(fleet(None));
        let input: &[u8] = b"# warm up\nadd a 0\nadd b 0\nsample a cpu 95\npick\nstatus\n\nstate b offline\npick\nbogus\n";
        let mut out = Vec::new();
        let (_tx, rx) = watch::channel(false);

        run_feed(&fleet, input, &mut out, rx).await.unwrap();

        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4, "{out}");
        assert_eq!(lines[0], "pick b");
        let states: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(states.as_array().unwrap().len(), 2);
        assert_eq!(states[0]["handle"], "a");
        assert_eq!(lines[2], "pick -");
        assert!(lines[3].starts_with("error: unknown command"), "{}", lines[3]);
    }
}
