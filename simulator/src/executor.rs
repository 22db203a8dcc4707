//! Adapter between profiles and the simulation backend.
//!
//! The platform physics (contention, topology, energy curves) are the
//! backend's concern; this module reduces a leaf profile on a concrete
//! allocation to a simulated duration that the per-job actor then sleeps
//! through on the virtual clock. Progress queries and cancellation are
//! served from the `(start, duration)` pair recorded in the task tree.

use crate::interval_set::IntervalSet;
use crate::machines::Machines;
use crate::profiles::{Profile, ProfileData};

/// Expands the EXECUTE_JOB executor mapping into the list of machine ids
/// each executor rank runs on. An empty mapping is the identity.
pub fn executor_hosts(allocation: &IntervalSet, mapping: &[u32]) -> Vec<u32> {
    let machines: Vec<u32> = allocation.iter().collect();
    if mapping.is_empty() {
        machines
    } else {
        mapping
            .iter()
            .map(|&idx| machines[idx as usize])
            .collect()
    }
}

/// The simulated duration of one leaf profile on the given executor hosts.
///
/// Compute time is work over the slowest allocated host; communication
/// volumes are turned into time over the reference bandwidth.
pub fn leaf_duration(
    profile: &Profile,
    hosts: &[u32],
    machines: &Machines,
    reference_bandwidth: f64,
) -> f64 {
    match &profile.data {
        ProfileData::Delay { delay, .. } => *delay,
        ProfileData::ParallelHomogeneous { cpu, com, .. } => {
            let n = hosts.len().max(1);
            let speed = min_speed(hosts, machines);
            let compute = if *cpu > 0.0 { cpu / speed } else { 0.0 };
            let comm = if *com > 0.0 && n > 1 {
                com * (n as f64 - 1.0) / reference_bandwidth
            } else {
                0.0
            };
            compute + comm
        }
        ProfileData::Parallel { cpu, com, nb_res } => {
            let n = *nb_res as usize;
            let mut worst = 0.0f64;
            for (rank, work) in cpu.iter().enumerate() {
                let speed = hosts
                    .get(rank)
                    .and_then(|&id| machines.get(id))
                    .map(|m| m.speed)
                    .unwrap_or(1e9);
                let row_com: f64 = com[rank * n..(rank + 1) * n].iter().sum();
                worst = worst.max(work / speed + row_com / reference_bandwidth);
            }
            worst
        }
        // Sequences are walked by the actor; SMPI replay is out of scope.
        ProfileData::Sequence { .. } | ProfileData::Smpi { .. } => 0.0,
    }
}

fn min_speed(hosts: &[u32], machines: &Machines) -> f64 {
    let speed = hosts
        .iter()
        .filter_map(|&id| machines.get(id))
        .map(|m| m.speed)
        .fold(f64::INFINITY, f64::min);
    if speed.is_finite() {
        speed
    } else {
        1e9
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machines() -> Machines {
        let doc = json!({"hosts": [
            {"name": "host0", "speed": 1e9},
            {"name": "host1", "speed": 2e9},
        ]});
        Machines::from_platform_json("p.json", &doc, "master_host", None).unwrap()
    }

    #[test]
    fn delay_duration_is_the_delay() {
        let p = Profile::from_json("d", json!({"type": "delay", "delay": 3.0})).unwrap();
        let m = machines();
        assert_eq!(leaf_duration(&p, &[0], &m, 1e9), 3.0);
    }

    #[test]
    fn homogeneous_duration_uses_the_slowest_host() {
        let p = Profile::from_json(
            "ph",
            json!({"type": "parallel_homogeneous", "cpu": 2e9, "com": 0.0}),
        )
        .unwrap();
        let m = machines();
        // host0 at 1 Gflop/s bounds the execution.
        assert_eq!(leaf_duration(&p, &[0, 1], &m, 1e9), 2.0);
        assert_eq!(leaf_duration(&p, &[1], &m, 1e9), 1.0);
    }

    #[test]
    fn communication_adds_over_the_reference_bandwidth() {
        let p = Profile::from_json(
            "ph",
            json!({"type": "parallel_homogeneous", "cpu": 0.0, "com": 5e8}),
        )
        .unwrap();
        let m = machines();
        // two hosts, one pairwise exchange of 5e8 bytes at 1e9 B/s
        assert_eq!(leaf_duration(&p, &[0, 1], &m, 1e9), 0.5);
        // a single host never communicates
        assert_eq!(leaf_duration(&p, &[0], &m, 1e9), 0.0);
    }

    #[test]
    fn mapping_expands_to_machine_ids() {
        let alloc = IntervalSet::from_string_hyphen("4-5", " ", "-").unwrap();
        assert_eq!(executor_hosts(&alloc, &[]), vec![4, 5]);
        assert_eq!(executor_hosts(&alloc, &[0, 0, 1, 1]), vec![4, 4, 5, 5]);
    }
}
