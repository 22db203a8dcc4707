//! End-to-end scenarios: a full simulation driven by a scripted in-process
//! scheduler, with assertions on the outbound message stream.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value};

use dslab_core::Simulation;

use dslab_batsim::batsim_checkpoint::CheckpointManager;
use dslab_batsim::config::sim_config::SimulationConfig;
use dslab_batsim::machines::Machines;
use dslab_batsim::protocol::{ProtocolError, SchedulerClient};
use dslab_batsim::simulation::BatsimSimulation;
use dslab_batsim::workload::{Workload, Workloads};

/// Replies to every JOB_SUBMITTED with an EXECUTE_JOB built by `on_submit`,
/// recording every request for later assertions.
struct ScriptedScheduler {
    log: Rc<RefCell<Vec<Value>>>,
    on_submit: Box<dyn FnMut(&str, f64) -> Vec<Value>>,
}

impl SchedulerClient for ScriptedScheduler {
    fn send_recv(&mut self, message: &str) -> Result<String, ProtocolError> {
        let request: Value = serde_json::from_str(message).unwrap();
        self.log.borrow_mut().push(request.clone());

        let now = request["now"].as_f64().unwrap();
        let mut events = Vec::new();
        for event in request["events"].as_array().unwrap() {
            if event["type"] == json!("JOB_SUBMITTED") {
                let job_id = event["data"]["job_id"].as_str().unwrap();
                events.extend((self.on_submit)(job_id, now));
            }
        }
        Ok(json!({"now": now, "events": events}).to_string())
    }
}

fn execute_reply(job_id: &str, alloc: &str, now: f64) -> Vec<Value> {
    vec![json!({
        "timestamp": now,
        "type": "EXECUTE_JOB",
        "data": {"job_id": job_id, "alloc": alloc}
    })]
}

fn platform(nb_hosts: usize) -> Machines {
    let hosts: Vec<Value> = (0..nb_hosts)
        .map(|i| json!({"name": format!("host{}", i), "speed": 1e9}))
        .collect();
    Machines::from_platform_json("platform.json", &json!({"hosts": hosts}), "master_host", None)
        .unwrap()
}

fn build_simulation(
    config: SimulationConfig,
    workload_doc: Value,
    nb_hosts: usize,
    on_submit: Box<dyn FnMut(&str, f64) -> Vec<Value>>,
) -> (BatsimSimulation, Rc<RefCell<Vec<Value>>>, tempfile::TempDir) {
    let out_dir = tempfile::tempdir().unwrap();
    let mut config = config;
    config.export_prefix = out_dir.path().to_string_lossy().into_owned();
    let config = Rc::new(config);

    let mut workload = Workload::new_static("w0", "test.json", &config, 1.0);
    workload
        .load_from_json(
            &workload_doc.to_string(),
            config.copy.as_ref(),
            config.submission_time_before.as_ref(),
            config.submission_time_after.as_ref(),
        )
        .unwrap();
    let mut workloads = Workloads::new();
    workloads.insert_workload(workload).unwrap();

    let log = Rc::new(RefCell::new(Vec::new()));
    let client = Box::new(ScriptedScheduler {
        log: log.clone(),
        on_submit,
    });
    let checkpoint = CheckpointManager::new(&config.export_prefix, 1);

    let simulation = BatsimSimulation::new(
        Simulation::new(42),
        config,
        json!({}),
        workloads,
        platform(nb_hosts),
        client,
        checkpoint,
    );
    (simulation, log, out_dir)
}

/// Every event of type `wanted` across all recorded messages, paired with
/// the `now` of the message that carried it.
fn events_of_type(log: &[Value], wanted: &str) -> Vec<(f64, Value)> {
    let mut result = Vec::new();
    for message in log {
        let now = message["now"].as_f64().unwrap();
        for event in message["events"].as_array().unwrap() {
            if event["type"] == json!(wanted) {
                result.push((now, event.clone()));
            }
        }
    }
    result
}

#[test]
fn single_delay_job_completes_successfully() {
    let workload = json!({
        "nb_res": 4,
        "jobs": [{"id": "1", "subtime": 0.0, "res": 2, "walltime": 10.0, "profile": "d"}],
        "profiles": {"d": {"type": "delay", "delay": 3.0}}
    });
    let (mut simulation, log, _out) = build_simulation(
        SimulationConfig::default(),
        workload,
        4,
        Box::new(|job_id, now| execute_reply(job_id, "0-1", now)),
    );
    simulation.run().unwrap();

    let log = log.borrow();
    let submitted = events_of_type(&log, "JOB_SUBMITTED");
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].0, 0.0);
    assert_eq!(submitted[0].1["data"]["job_id"], json!("w0!1"));

    let completed = events_of_type(&log, "JOB_COMPLETED");
    assert_eq!(completed.len(), 1);
    let (now, event) = &completed[0];
    assert_eq!(*now, 3.0);
    assert_eq!(event["timestamp"], json!(3.0));
    assert_eq!(event["data"]["job_state"], json!("COMPLETED_SUCCESSFULLY"));
    assert_eq!(event["data"]["alloc"], json!("0-1"));
    assert_eq!(event["data"]["return_code"], json!(0));

    assert_eq!(events_of_type(&log, "SIMULATION_ENDS").len(), 1);
}

#[test]
fn walltime_kills_the_job() {
    let workload = json!({
        "nb_res": 4,
        "jobs": [{"id": "1", "subtime": 0.0, "res": 2, "walltime": 2.0, "profile": "d"}],
        "profiles": {"d": {"type": "delay", "delay": 3.0}}
    });
    let (mut simulation, log, _out) = build_simulation(
        SimulationConfig::default(),
        workload,
        4,
        Box::new(|job_id, now| execute_reply(job_id, "0-1", now)),
    );
    simulation.run().unwrap();

    let log = log.borrow();
    let completed = events_of_type(&log, "JOB_COMPLETED");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, 2.0);
    assert_eq!(
        completed[0].1["data"]["job_state"],
        json!("COMPLETED_WALLTIME_REACHED")
    );
}

#[test]
fn zero_delay_job_completes_without_observable_duration() {
    let workload = json!({
        "nb_res": 1,
        "jobs": [{"id": "1", "subtime": 0.0, "res": 1, "profile": "d"}],
        "profiles": {"d": {"type": "delay", "delay": 0.0}}
    });
    let (mut simulation, log, _out) = build_simulation(
        SimulationConfig::default(),
        workload,
        1,
        Box::new(|job_id, now| execute_reply(job_id, "0", now)),
    );
    simulation.run().unwrap();

    let completed = events_of_type(&log.borrow(), "JOB_COMPLETED");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, 0.0);
    assert_eq!(
        completed[0].1["data"]["job_state"],
        json!("COMPLETED_SUCCESSFULLY")
    );
}

#[test]
fn fixed_failure_kills_and_resubmits_the_job() {
    let workload = json!({
        "nb_res": 1,
        "jobs": [{"id": "1", "subtime": 0.0, "res": 1, "profile": "d"}],
        "profiles": {"d": {"type": "delay", "delay": 100.0}}
    });
    let mut config = SimulationConfig::default();
    config.failures.fixed_failures = Some(60.0);
    config.failures.repair_time = 0.0;
    config.failures.seed_failures = Some(42);
    config.checkpointing.enabled = true;

    let (mut simulation, log, _out) = build_simulation(
        config,
        workload,
        1,
        Box::new(|job_id, now| execute_reply(job_id, "0", now)),
    );
    simulation.run().unwrap();

    let log = log.borrow();
    // The failure at t=60 kills the job at progress 0.6.
    let killed = events_of_type(&log, "JOB_KILLED");
    assert_eq!(killed.len(), 1);
    assert_eq!(killed[0].0, 60.0);
    let msg = &killed[0].1["data"]["job_msgs"][0];
    assert_eq!(msg["id"], json!("w0!1"));
    assert_eq!(msg["forWhat"], json!(1));
    let progress = msg["job_progress"]["progress"].as_f64().unwrap();
    assert!((progress - 0.6).abs() < 1e-9, "progress was {}", progress);

    // The job is resubmitted as #1 with the remaining work.
    let submitted = events_of_type(&log, "JOB_SUBMITTED");
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[1].1["data"]["job_id"], json!("w0!1#1"));
    assert_eq!(submitted[1].0, 60.0);

    // Remaining work is (1 - 0.6) * 100 = 40, so the retry ends at t=100.
    let completed = events_of_type(&log, "JOB_COMPLETED");
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[0].1["data"]["job_state"], json!("COMPLETED_KILLED"));
    assert_eq!(completed[1].1["data"]["job_id"], json!("w0!1#1"));
    assert_eq!(
        completed[1].1["data"]["job_state"],
        json!("COMPLETED_SUCCESSFULLY")
    );
    assert_eq!(completed[1].0, 100.0);

    // The machine failure surfaced to the scheduler.
    let notifies = events_of_type(&log, "NOTIFY");
    assert!(notifies
        .iter()
        .any(|(_, e)| e["data"]["type"] == json!("event_resource_unavailable")));
    assert!(notifies
        .iter()
        .any(|(_, e)| e["data"]["type"] == json!("job_fault")));
}

#[test]
fn reservation_with_future_allocation_starts_at_its_anchor() {
    let workload = json!({
        "nb_res": 2,
        "jobs": [{
            "id": "1", "subtime": 0.0, "res": 2, "walltime": 10.0, "profile": "d",
            "purpose": "reservation", "start": 5.0, "alloc": "0-1"
        }],
        "profiles": {"d": {"type": "delay", "delay": 3.0}}
    });
    // The scheduler never answers EXECUTE_JOB: the reservation starts by
    // itself on its pre-declared allocation.
    let (mut simulation, log, _out) = build_simulation(
        SimulationConfig::default(),
        workload,
        2,
        Box::new(|_job_id, _now| Vec::new()),
    );
    simulation.run().unwrap();

    let completed = events_of_type(&log.borrow(), "JOB_COMPLETED");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, 8.0);
    assert_eq!(
        completed[0].1["data"]["job_state"],
        json!("COMPLETED_SUCCESSFULLY")
    );
    assert_eq!(completed[0].1["data"]["alloc"], json!("0-1"));
}

#[test]
fn undersized_allocation_is_rejected_not_fatal() {
    let workload = json!({
        "nb_res": 4,
        "jobs": [{"id": "1", "subtime": 0.0, "res": 2, "walltime": 10.0, "profile": "d"}],
        "profiles": {"d": {"type": "delay", "delay": 3.0}}
    });
    // One machine for a two-machine job.
    let (mut simulation, log, _out) = build_simulation(
        SimulationConfig::default(),
        workload,
        4,
        Box::new(|job_id, now| execute_reply(job_id, "0", now)),
    );
    simulation.run().unwrap();

    let completed = events_of_type(&log.borrow(), "JOB_COMPLETED");
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].1["data"]["job_state"],
        json!("REJECTED_NOT_ENOUGH_RESOURCES")
    );
}

#[test]
fn timestamps_are_non_decreasing_within_every_message() {
    let workload = json!({
        "nb_res": 2,
        "jobs": [
            {"id": "1", "subtime": 0.0, "res": 1, "walltime": 20.0, "profile": "d"},
            {"id": "2", "subtime": 1.0, "res": 1, "walltime": 20.0, "profile": "d"}
        ],
        "profiles": {"d": {"type": "delay", "delay": 3.0}}
    });
    let mut next = 0u32;
    let (mut simulation, log, _out) = build_simulation(
        SimulationConfig::default(),
        workload,
        2,
        Box::new(move |job_id, now| {
            let alloc = next.to_string();
            next += 1;
            execute_reply(job_id, &alloc, now)
        }),
    );
    simulation.run().unwrap();

    for message in log.borrow().iter() {
        let now = message["now"].as_f64().unwrap();
        let mut previous = f64::NEG_INFINITY;
        for event in message["events"].as_array().unwrap() {
            let timestamp = event["timestamp"].as_f64().unwrap();
            assert!(timestamp >= previous, "events went back in time");
            assert!(timestamp <= now, "event after 'now'");
            previous = timestamp;
        }
    }
}

/// A scheduler whose reply reorders its own events; the simulation must
/// abort with a protocol error and send nothing further.
struct ReorderingScheduler {
    log: Rc<RefCell<Vec<Value>>>,
}

impl SchedulerClient for ReorderingScheduler {
    fn send_recv(&mut self, message: &str) -> Result<String, ProtocolError> {
        let request: Value = serde_json::from_str(message).unwrap();
        self.log.borrow_mut().push(request.clone());
        let now = request["now"].as_f64().unwrap();
        Ok(json!({
            "now": now,
            "events": [
                {"timestamp": now, "type": "NOTIFY", "data": {"type": "continue_registration"}},
                {"timestamp": now - 1.0, "type": "NOTIFY", "data": {"type": "continue_registration"}}
            ]
        })
        .to_string())
    }
}

#[test]
fn reordered_reply_aborts_the_simulation() {
    let workload = json!({
        "nb_res": 1,
        "jobs": [{"id": "1", "subtime": 0.0, "res": 1, "profile": "d"}],
        "profiles": {"d": {"type": "delay", "delay": 3.0}}
    });
    let out_dir = tempfile::tempdir().unwrap();
    let mut config = SimulationConfig::default();
    config.export_prefix = out_dir.path().to_string_lossy().into_owned();
    let config = Rc::new(config);

    let mut w = Workload::new_static("w0", "test.json", &config, 1.0);
    w.load_from_json(&workload.to_string(), None, None, None).unwrap();
    let mut workloads = Workloads::new();
    workloads.insert_workload(w).unwrap();

    let log = Rc::new(RefCell::new(Vec::new()));
    let client = Box::new(ReorderingScheduler { log: log.clone() });
    let checkpoint = CheckpointManager::new(&config.export_prefix, 1);
    let mut simulation = BatsimSimulation::new(
        Simulation::new(42),
        config,
        json!({}),
        workloads,
        platform(1),
        client,
        checkpoint,
    );

    assert!(simulation.run().is_err());
    // Only the first outbound message was ever sent.
    assert_eq!(log.borrow().len(), 1);
}
