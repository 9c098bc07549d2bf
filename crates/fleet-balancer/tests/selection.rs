//! Statistical behaviour of weighted selection and the workload averages.

use fleet_balancer::LoadBalancer;
use fleet_core::{Level, ServerState, WorkloadSettings};
use rand::SeedableRng;
use rand::rngs::StdRng;

#[test]
fn picks_follow_level_weights() {
    let mut lb = LoadBalancer::new(WorkloadSettings::default());
    // Default weights for these levels: 50, 30, 15, 5, 0.
    let levels = [Level::Level0, Level::Level2, Level::Level5, Level::Level7, Level::Level9];
    for (handle, level) in levels.iter().enumerate() {
        lb.try_add_server(handle, *level, 0).unwrap();
    }

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut counts = [0u32; 5];
    const DRAWS: u32 = 100_000;
    for _ in 0..DRAWS {
        let picked = lb.try_get_server_with(&mut rng, |_| true).unwrap();
        counts[picked] += 1;
    }

    assert_eq!(counts[4], 0, "a weight-0 server must never be picked");
    let expected = [0.50, 0.30, 0.15, 0.05];
    for (handle, share) in expected.iter().enumerate() {
        let want = share * f64::from(DRAWS);
        let got = f64::from(counts[handle]);
        let error = (got - want).abs() / want;
        assert!(error <= 0.05, "server {handle}: {got} picks, expected about {want}");
    }
}

#[test]
fn average_workload_follows_server_levels() {
    let mut lb = LoadBalancer::new(WorkloadSettings::default());
    for handle in 0..8 {
        lb.try_add_server(handle, Level::Level2, 0).unwrap();
    }
    assert_eq!(lb.average_workload(), Level::Level2);
    assert_eq!(lb.average_workload_for_available_servers(), Level::Level2);
    assert_eq!(lb.total_workload(), 16);

    for handle in 0..8 {
        lb.try_update_server(&handle, Level::HIGHEST, 0, ServerState::Normal)
            .unwrap();
    }
    assert_eq!(lb.average_workload(), Level::HIGHEST);
    assert!(lb.try_get_server().is_none());
}

#[test]
fn empty_balancer_reads_lowest() {
    let lb: LoadBalancer<u32> = LoadBalancer::new(WorkloadSettings::default());
    assert_eq!(lb.average_workload(), Level::LOWEST);
    assert_eq!(lb.average_workload_for_available_servers(), Level::LOWEST);
    assert_eq!(lb.total_workload(), 0);
    assert!(lb.server_states().is_empty());
}
