//! Bidirectional JSON codec for the scheduler wire protocol.
//!
//! Every message is `{"now": <number>, "events": [{"timestamp", "type",
//! "data"}, ...]}`. The writer enforces non-decreasing timestamps across
//! appended events; the reader validates the reply shape and returns typed
//! events, treating any deviation as a protocol error (the scheduler is
//! buggy, retrying cannot help).

use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::interval_set::IntervalSet;
use crate::machines::Machines;
use crate::workload::Workloads;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON message: {0}")]
    Malformed(String),
    #[error("invalid JSON message: event {0} has an unknown 'type' value '{1}'")]
    UnknownEventType(usize, String),
    #[error(
        "invalid JSON message: timestamp {timestamp} of event {index} should be \
         lower than or equal to now={now}"
    )]
    TimestampAfterNow {
        index: usize,
        timestamp: f64,
        now: f64,
    },
    #[error(
        "invalid JSON message: event {index} at timestamp {timestamp} precedes \
         the previous event at {previous}"
    )]
    NonMonotonicTimestamps {
        index: usize,
        timestamp: f64,
        previous: f64,
    },
    #[error("scheduler transport error: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    Violation(String),
}

/// Blocking request/reply channel to the scheduler. Exactly one message is
/// in flight at any moment.
pub trait SchedulerClient {
    fn send_recv(&mut self, message: &str) -> Result<String, ProtocolError>;
}

/// The production transport: a ZMQ REQ socket, newline-free JSON payloads.
pub struct ZmqSchedulerClient {
    socket: zmq::Socket,
}

impl ZmqSchedulerClient {
    pub fn connect(endpoint: &str) -> Result<Self, ProtocolError> {
        let context = zmq::Context::new();
        let socket = context
            .socket(zmq::REQ)
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        socket
            .connect(endpoint)
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        Ok(Self { socket })
    }
}

impl SchedulerClient for ZmqSchedulerClient {
    fn send_recv(&mut self, message: &str) -> Result<String, ProtocolError> {
        self.socket
            .send(message, 0)
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        self.socket
            .recv_string(0)
            .map_err(|e| ProtocolError::Transport(e.to_string()))?
            .map_err(|_| ProtocolError::Transport("non-UTF8 reply".to_string()))
    }
}

/// One entry of an outbound JOB_KILLED message.
pub struct KillMsgOut {
    pub job_id: String,
    pub for_what: u8,
    pub progress: Option<Value>,
}

/// Builds outbound messages event by event.
pub struct JsonProtocolWriter {
    events: Vec<Value>,
    last_date: f64,
    is_empty: bool,
}

impl Default for JsonProtocolWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonProtocolWriter {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            last_date: 0.0,
            is_empty: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_empty
    }

    /// Resets the writer between round trips.
    pub fn clear(&mut self) {
        self.events.clear();
        self.is_empty = true;
    }

    pub fn generate_current_message(&mut self, now: f64) -> String {
        assert!(now >= self.last_date, "Date inconsistency");
        let message = json!({
            "now": now,
            "events": std::mem::take(&mut self.events),
        });
        message.to_string()
    }

    fn push_event(&mut self, date: f64, event_type: &str, data: Value) {
        assert!(date >= self.last_date, "Date inconsistency");
        self.last_date = date;
        self.is_empty = false;
        self.events.push(json!({
            "timestamp": date,
            "type": event_type,
            "data": data,
        }));
    }

    pub fn append_simulation_begins(
        &mut self,
        machines: &Machines,
        workloads: &Workloads,
        configuration: &Value,
        allow_compute_sharing: bool,
        allow_storage_sharing: bool,
        date: f64,
    ) {
        let compute_resources: Vec<Value> = machines
            .compute_machines()
            .map(|m| m.to_json_value())
            .collect();
        let storage_resources: Vec<Value> = machines
            .storage_machines()
            .map(|m| m.to_json_value())
            .collect();

        let mut workloads_dict = Map::new();
        let mut jobs_dict = Map::new();
        let mut profiles_dict = Map::new();
        for workload in workloads.iter() {
            workloads_dict.insert(workload.name.clone(), json!(workload.file));
            let jobs: Vec<Value> = workload
                .jobs
                .ids_sorted_by_submission()
                .iter()
                .map(|id| workload.jobs.get(id).unwrap().json_description.clone())
                .collect();
            jobs_dict.insert(workload.name.clone(), Value::Array(jobs));
            let mut profile_dict = Map::new();
            for profile in workload.profiles.profiles() {
                profile_dict.insert(profile.name.clone(), profile.json.clone());
            }
            profiles_dict.insert(workload.name.clone(), Value::Object(profile_dict));
        }

        let data = json!({
            "nb_resources": machines.nb_machines(),
            "nb_compute_resources": machines.nb_compute_machines(),
            "nb_storage_resources": machines.nb_storage_machines(),
            "allow_compute_sharing": allow_compute_sharing,
            "allow_storage_sharing": allow_storage_sharing,
            "config": configuration,
            "compute_resources": compute_resources,
            "storage_resources": storage_resources,
            "workloads": workloads_dict,
            "jobs": jobs_dict,
            "profiles": profiles_dict,
        });
        self.push_event(date, "SIMULATION_BEGINS", data);
    }

    pub fn append_simulation_ends(&mut self, date: f64) {
        self.push_event(date, "SIMULATION_ENDS", json!({}));
    }

    pub fn append_job_submitted(
        &mut self,
        job_id: &str,
        job_json: &Value,
        profile_json: Option<&Value>,
        date: f64,
    ) {
        let mut data = json!({
            "job_id": job_id,
            "job": job_json,
        });
        if let Some(profile) = profile_json {
            data["profile"] = profile.clone();
        }
        self.push_event(date, "JOB_SUBMITTED", data);
    }

    pub fn append_job_completed(
        &mut self,
        job_id: &str,
        job_state: &str,
        job_alloc: &str,
        return_code: i32,
        date: f64,
    ) {
        let data = json!({
            "job_id": job_id,
            "job_state": job_state,
            "return_code": return_code,
            "alloc": job_alloc,
        });
        self.push_event(date, "JOB_COMPLETED", data);
    }

    pub fn append_job_killed(&mut self, job_msgs: &[KillMsgOut], date: f64) {
        let job_ids: Vec<&str> = job_msgs.iter().map(|m| m.job_id.as_str()).collect();
        let msgs: Vec<Value> = job_msgs
            .iter()
            .map(|m| {
                let mut msg = json!({
                    "id": m.job_id,
                    "forWhat": m.for_what,
                });
                if let Some(progress) = &m.progress {
                    msg["job_progress"] = progress.clone();
                }
                msg
            })
            .collect();
        let data = json!({
            "job_ids": job_ids,
            "job_msgs": msgs,
        });
        self.push_event(date, "JOB_KILLED", data);
    }

    pub fn append_resource_state_changed(
        &mut self,
        resources: &IntervalSet,
        new_state: &str,
        date: f64,
    ) {
        let data = json!({
            "resources": resources.to_string_hyphen(" ", "-"),
            "state": new_state,
        });
        self.push_event(date, "RESOURCE_STATE_CHANGED", data);
    }

    pub fn append_requested_call(&mut self, date: f64, id: i64, for_what: u8) {
        self.push_event(date, "REQUESTED_CALL", json!({"id": id, "forWhat": for_what}));
    }

    pub fn append_answer_energy(&mut self, consumed_energy: f64, date: f64) {
        self.push_event(date, "ANSWER", json!({"consumed_energy": consumed_energy}));
    }

    pub fn append_query_estimate_waiting_time(
        &mut self,
        job_id: &str,
        job_json: &Value,
        date: f64,
    ) {
        let data = json!({
            "requests": {
                "estimate_waiting_time": {
                    "job_id": job_id,
                    "job": job_json,
                }
            }
        });
        self.push_event(date, "QUERY", data);
    }

    pub fn append_notify(&mut self, notify_type: &str, date: f64) {
        self.push_event(date, "NOTIFY", json!({"type": notify_type}));
    }

    pub fn append_notify_resource_event(
        &mut self,
        notify_type: &str,
        resources: &IntervalSet,
        date: f64,
    ) {
        let data = json!({
            "type": notify_type,
            "resources": resources.to_string_hyphen(" ", "-"),
        });
        self.push_event(date, "NOTIFY", data);
    }

    pub fn append_notify_job_fault_event(&mut self, job_id: &str, date: f64) {
        self.push_event(date, "NOTIFY", json!({"type": "job_fault", "job": job_id}));
    }

    pub fn append_notify_generic_event(&mut self, data: Value, date: f64) {
        self.push_event(date, "NOTIFY", data);
    }

    pub fn append_from_job_message(&mut self, job_id: &str, message: &Value, date: f64) {
        let data = json!({
            "job_id": job_id,
            "msg": message,
        });
        self.push_event(date, "FROM_JOB_MSG", data);
    }
}

/// A kill request for one job.
#[derive(Clone, Debug)]
pub struct KillRequestMsg {
    pub job_id: String,
    pub for_what: u8,
}

/// The `additional_io_job` attachment of EXECUTE_JOB.
#[derive(Clone, Debug)]
pub struct IoJobDescription {
    pub alloc: IntervalSet,
    pub profile_name: String,
    pub profile: Option<Value>,
}

#[derive(Clone, Debug)]
pub enum NotifyEvent {
    RegistrationFinished,
    ContinueRegistration,
    Checkpoint,
    RecoverFromCheckpoint,
    /// Scalar telemetry stashed in the server context (queue_size,
    /// schedule_size, number_running_jobs, utilization, ...).
    Scalar { kind: String, value: String },
}

#[derive(Clone, Debug)]
pub enum SchedulerEvent {
    QueryConsumedEnergy,
    AnswerEstimateWaitingTime {
        job_id: String,
        estimated_waiting_time: f64,
    },
    RejectJob {
        job_id: String,
    },
    ExecuteJob {
        job_id: String,
        alloc: IntervalSet,
        mapping: Vec<u32>,
        storage_mapping: FxHashMap<String, u32>,
        additional_io_job: Option<IoJobDescription>,
    },
    ChangeJobState {
        job_id: String,
        job_state: String,
    },
    CallMeLater {
        target_time: f64,
        id: i64,
        for_what: u8,
    },
    KillJob {
        job_msgs: Vec<KillRequestMsg>,
    },
    RegisterJob {
        job_id: String,
        job: Value,
    },
    RegisterProfile {
        workload_name: String,
        profile_name: String,
        profile: Value,
    },
    SetResourceState {
        resources: IntervalSet,
        state: i32,
    },
    SetJobMetadata {
        job_id: String,
        metadata: String,
    },
    Notify(NotifyEvent),
    ToJobMsg {
        job_id: String,
        msg: String,
    },
}

pub struct TimestampedEvent {
    pub timestamp: f64,
    pub event: SchedulerEvent,
}

pub struct SchedulerReply {
    pub now: f64,
    pub events: Vec<TimestampedEvent>,
}

/// Parses and validates one scheduler reply.
pub fn parse_message(message: &str) -> Result<SchedulerReply, ProtocolError> {
    let doc: Value = serde_json::from_str(message)
        .map_err(|e| ProtocolError::Malformed(format!("could not be parsed: {}", e)))?;
    if !doc.is_object() {
        return Err(ProtocolError::Malformed("not a JSON object".to_string()));
    }
    let now = doc
        .get("now")
        .and_then(Value::as_f64)
        .ok_or_else(|| ProtocolError::Malformed("'now' value should be a number".to_string()))?;
    let events_array = doc
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| ProtocolError::Malformed("'events' value should be an array".to_string()))?;

    let mut events = Vec::with_capacity(events_array.len());
    let mut previous_timestamp = f64::NEG_INFINITY;
    for (index, event_object) in events_array.iter().enumerate() {
        if !event_object.is_object() {
            return Err(ProtocolError::Malformed(format!(
                "event {} should be an object",
                index
            )));
        }
        let timestamp = event_object
            .get("timestamp")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                ProtocolError::Malformed(format!("event {} has no numeric 'timestamp'", index))
            })?;
        if timestamp > now {
            return Err(ProtocolError::TimestampAfterNow {
                index,
                timestamp,
                now,
            });
        }
        if timestamp < previous_timestamp {
            return Err(ProtocolError::NonMonotonicTimestamps {
                index,
                timestamp,
                previous: previous_timestamp,
            });
        }
        previous_timestamp = timestamp;

        let event_type = event_object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProtocolError::Malformed(format!("event {} has no string 'type'", index))
            })?;
        let data = event_object.get("data").ok_or_else(|| {
            ProtocolError::Malformed(format!("event {} should have a 'data' key", index))
        })?;

        let event = parse_event(index, event_type, data)?;
        events.push(TimestampedEvent { timestamp, event });
    }
    Ok(SchedulerReply { now, events })
}

fn field_str<'a>(index: usize, data: &'a Value, field: &str) -> Result<&'a str, ProtocolError> {
    data.get(field).and_then(Value::as_str).ok_or_else(|| {
        ProtocolError::Malformed(format!(
            "event {}: ['data']['{}'] should be a string",
            index, field
        ))
    })
}

fn parse_interval(index: usize, field: &str, value: &str) -> Result<IntervalSet, ProtocolError> {
    IntervalSet::from_string_hyphen(value, " ", "-").map_err(|e| {
        ProtocolError::Malformed(format!("event {}: bad '{}' value: {}", index, field, e))
    })
}

fn parse_event(index: usize, event_type: &str, data: &Value) -> Result<SchedulerEvent, ProtocolError> {
    if !data.is_object() {
        return Err(ProtocolError::Malformed(format!(
            "the 'data' value of event {} ({}) should be an object",
            index, event_type
        )));
    }
    match event_type {
        "QUERY" => {
            let requests = data
                .get("requests")
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (QUERY) must have a non-empty 'requests' object",
                        index
                    ))
                })?;
            if requests.len() != 1 || !requests.contains_key("consumed_energy") {
                return Err(ProtocolError::Malformed(format!(
                    "event {} (QUERY): only the 'consumed_energy' request is supported",
                    index
                )));
            }
            Ok(SchedulerEvent::QueryConsumedEnergy)
        }
        "ANSWER" => {
            let answer = data
                .get("estimate_waiting_time")
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (ANSWER): unknown answer type",
                        index
                    ))
                })?;
            let job_id = answer
                .get("job_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (ANSWER): missing 'job_id'",
                        index
                    ))
                })?;
            let estimated_waiting_time = answer
                .get("estimated_waiting_time")
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (ANSWER): missing 'estimated_waiting_time'",
                        index
                    ))
                })?;
            Ok(SchedulerEvent::AnswerEstimateWaitingTime {
                job_id: job_id.to_string(),
                estimated_waiting_time,
            })
        }
        "REJECT_JOB" => Ok(SchedulerEvent::RejectJob {
            job_id: field_str(index, data, "job_id")?.to_string(),
        }),
        "EXECUTE_JOB" => parse_execute_job(index, data),
        "CHANGE_JOB_STATE" => Ok(SchedulerEvent::ChangeJobState {
            job_id: field_str(index, data, "job_id")?.to_string(),
            job_state: field_str(index, data, "job_state")?.to_string(),
        }),
        "CALL_ME_LATER" => {
            let target_time = data
                .get("timestamp")
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (CALL_ME_LATER): missing numeric 'timestamp'",
                        index
                    ))
                })?;
            let id = data.get("id").and_then(Value::as_i64).ok_or_else(|| {
                ProtocolError::Malformed(format!(
                    "event {} (CALL_ME_LATER): missing integer 'id'",
                    index
                ))
            })?;
            let for_what = data.get("forWhat").and_then(Value::as_i64).ok_or_else(|| {
                ProtocolError::Malformed(format!(
                    "event {} (CALL_ME_LATER): missing integer 'forWhat'",
                    index
                ))
            })?;
            Ok(SchedulerEvent::CallMeLater {
                target_time,
                id,
                for_what: for_what as u8,
            })
        }
        "KILL_JOB" => {
            let job_msgs = data
                .get("job_msgs")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (KILL_JOB): missing 'job_msgs' array",
                        index
                    ))
                })?;
            if job_msgs.is_empty() {
                return Err(ProtocolError::Malformed(format!(
                    "event {} (KILL_JOB): 'job_msgs' should be non-empty",
                    index
                )));
            }
            let mut msgs = Vec::with_capacity(job_msgs.len());
            for msg in job_msgs {
                let job_id = msg.get("id").and_then(Value::as_str).ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (KILL_JOB): a kill message has no 'id'",
                        index
                    ))
                })?;
                let for_what = msg.get("forWhat").and_then(Value::as_i64).ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (KILL_JOB): a kill message has no 'forWhat'",
                        index
                    ))
                })?;
                msgs.push(KillRequestMsg {
                    job_id: job_id.to_string(),
                    for_what: for_what as u8,
                });
            }
            Ok(SchedulerEvent::KillJob { job_msgs: msgs })
        }
        "REGISTER_JOB" => {
            let job = data.get("job").cloned().ok_or_else(|| {
                ProtocolError::Malformed(format!(
                    "event {} (REGISTER_JOB): missing 'job' object",
                    index
                ))
            })?;
            Ok(SchedulerEvent::RegisterJob {
                job_id: field_str(index, data, "job_id")?.to_string(),
                job,
            })
        }
        "REGISTER_PROFILE" => {
            let profile = data.get("profile").cloned().ok_or_else(|| {
                ProtocolError::Malformed(format!(
                    "event {} (REGISTER_PROFILE): missing 'profile' object",
                    index
                ))
            })?;
            Ok(SchedulerEvent::RegisterProfile {
                workload_name: field_str(index, data, "workload_name")?.to_string(),
                profile_name: field_str(index, data, "profile_name")?.to_string(),
                profile,
            })
        }
        "SET_RESOURCE_STATE" => {
            let resources = parse_interval(index, "resources", field_str(index, data, "resources")?)?;
            if resources.is_empty() {
                return Err(ProtocolError::Malformed(format!(
                    "event {} (SET_RESOURCE_STATE): empty resource set",
                    index
                )));
            }
            let state_str = field_str(index, data, "state")?;
            let state: i32 = state_str.parse().map_err(|_| {
                ProtocolError::Malformed(format!(
                    "event {} (SET_RESOURCE_STATE): 'state' should be a string \
                     corresponding to an integer (got '{}')",
                    index, state_str
                ))
            })?;
            Ok(SchedulerEvent::SetResourceState { resources, state })
        }
        "SET_JOB_METADATA" => {
            let metadata = field_str(index, data, "metadata")?;
            if metadata.contains('"') {
                return Err(ProtocolError::Malformed(format!(
                    "event {} (SET_JOB_METADATA): metadata should not contain double quotes",
                    index
                )));
            }
            Ok(SchedulerEvent::SetJobMetadata {
                job_id: field_str(index, data, "job_id")?.to_string(),
                metadata: metadata.to_string(),
            })
        }
        "NOTIFY" => parse_notify(index, data),
        "TO_JOB_MSG" => Ok(SchedulerEvent::ToJobMsg {
            job_id: field_str(index, data, "job_id")?.to_string(),
            msg: field_str(index, data, "msg")?.to_string(),
        }),
        other => Err(ProtocolError::UnknownEventType(index, other.to_string())),
    }
}

fn parse_execute_job(index: usize, data: &Value) -> Result<SchedulerEvent, ProtocolError> {
    let job_id = field_str(index, data, "job_id")?.to_string();
    let alloc = parse_interval(index, "alloc", field_str(index, data, "alloc")?)?;
    if alloc.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "event {} (EXECUTE_JOB): the number of allocated resources should be \
             strictly positive",
            index
        )));
    }
    let nb_allocated = alloc.size();

    let mapping = match data.get("mapping") {
        None => Vec::new(),
        Some(Value::Object(mapping_value)) => {
            if mapping_value.is_empty() {
                return Err(ProtocolError::Malformed(format!(
                    "event {} (EXECUTE_JOB): 'mapping' must be a non-empty object",
                    index
                )));
            }
            let mut entries: Vec<(u32, u32)> = Vec::with_capacity(mapping_value.len());
            for (key, value) in mapping_value {
                let executor: u32 = key.parse().map_err(|_| {
                    ProtocolError::Malformed(format!(
                        "event {} (EXECUTE_JOB): mapping keys must be integers",
                        index
                    ))
                })?;
                let resource = match value {
                    Value::Number(n) => n.as_u64().map(|v| v as u32),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                }
                .ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (EXECUTE_JOB): mapping values must be integers",
                        index
                    ))
                })?;
                if resource >= nb_allocated {
                    return Err(ProtocolError::Malformed(format!(
                        "event {} (EXECUTE_JOB): executor {} should use the {}-th \
                         resource within the allocation, but there are only {} \
                         allocated resources",
                        index, executor, resource, nb_allocated
                    )));
                }
                entries.push((executor, resource));
            }
            entries.sort_unstable();
            for (expected, &(executor, _)) in entries.iter().enumerate() {
                if executor as usize != expected {
                    return Err(ProtocolError::Malformed(format!(
                        "event {} (EXECUTE_JOB): no resource associated to executor {}",
                        index, expected
                    )));
                }
            }
            entries.into_iter().map(|(_, resource)| resource).collect()
        }
        Some(_) => {
            return Err(ProtocolError::Malformed(format!(
                "event {} (EXECUTE_JOB): 'mapping' should be an object",
                index
            )))
        }
    };

    let storage_mapping = match data.get("storage_mapping") {
        None => FxHashMap::default(),
        Some(Value::Object(mapping_value)) => {
            let mut result = FxHashMap::default();
            for (key, value) in mapping_value {
                let machine = value.as_u64().ok_or_else(|| {
                    ProtocolError::Malformed(format!(
                        "event {} (EXECUTE_JOB): 'storage_mapping' values must be integers",
                        index
                    ))
                })?;
                result.insert(key.clone(), machine as u32);
            }
            result
        }
        Some(_) => {
            return Err(ProtocolError::Malformed(format!(
                "event {} (EXECUTE_JOB): 'storage_mapping' should be an object",
                index
            )))
        }
    };

    let additional_io_job = match data.get("additional_io_job") {
        None => None,
        Some(io_value) => {
            let profile_name = field_str(index, io_value, "profile_name")?.to_string();
            let io_alloc =
                parse_interval(index, "alloc", field_str(index, io_value, "alloc")?)?;
            Some(IoJobDescription {
                alloc: io_alloc,
                profile_name,
                profile: io_value.get("profile").cloned(),
            })
        }
    };

    Ok(SchedulerEvent::ExecuteJob {
        job_id,
        alloc,
        mapping,
        storage_mapping,
        additional_io_job,
    })
}

fn parse_notify(index: usize, data: &Value) -> Result<SchedulerEvent, ProtocolError> {
    let notify_type = field_str(index, data, "type")?;
    let scalar_kinds = [
        "queue_size",
        "schedule_size",
        "number_running_jobs",
        "utilization",
        "utilization_no_resv",
        "PID",
    ];
    let event = match notify_type {
        "registration_finished" => NotifyEvent::RegistrationFinished,
        "continue_registration" => NotifyEvent::ContinueRegistration,
        "checkpoint" => NotifyEvent::Checkpoint,
        "recover_from_checkpoint" => NotifyEvent::RecoverFromCheckpoint,
        kind if scalar_kinds.contains(&kind) => NotifyEvent::Scalar {
            kind: kind.to_string(),
            value: field_str(index, data, "data")?.to_string(),
        },
        other => {
            return Err(ProtocolError::Malformed(format!(
                "unknown NOTIFY type received ('{}')",
                other
            )))
        }
    };
    Ok(SchedulerEvent::Notify(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_produces_now_and_events() {
        let mut writer = JsonProtocolWriter::new();
        writer.append_notify("no_more_static_job_to_submit", 4.0);
        writer.append_job_completed("w0!1", "COMPLETED_SUCCESSFULLY", "0-1", 0, 5.0);
        let message = writer.generate_current_message(5.0);
        let doc: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(doc["now"], json!(5.0));
        let events = doc["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], json!("NOTIFY"));
        assert_eq!(events[1]["data"]["alloc"], json!("0-1"));
    }

    #[test]
    #[should_panic(expected = "Date inconsistency")]
    fn writer_rejects_decreasing_dates() {
        let mut writer = JsonProtocolWriter::new();
        writer.append_notify("no_more_static_job_to_submit", 5.0);
        writer.append_notify("no_more_static_job_to_submit", 3.0);
    }

    #[test]
    fn writer_clear_resets_between_round_trips() {
        let mut writer = JsonProtocolWriter::new();
        writer.append_simulation_ends(1.0);
        assert!(!writer.is_empty());
        let _ = writer.generate_current_message(1.0);
        writer.clear();
        assert!(writer.is_empty());
    }

    #[test]
    fn job_killed_carries_progress_trees() {
        let mut writer = JsonProtocolWriter::new();
        writer.append_job_killed(
            &[
                KillMsgOut {
                    job_id: "w0!1".to_string(),
                    for_what: 3,
                    progress: Some(json!({"profile_name": "d", "progress": 0.52})),
                },
                KillMsgOut {
                    job_id: "w0!2".to_string(),
                    for_what: 2,
                    progress: None,
                },
            ],
            10.0,
        );
        let message = writer.generate_current_message(10.0);
        let doc: Value = serde_json::from_str(&message).unwrap();
        let data = &doc["events"][0]["data"];
        assert_eq!(data["job_ids"], json!(["w0!1", "w0!2"]));
        assert_eq!(data["job_msgs"][0]["forWhat"], json!(3));
        assert_eq!(data["job_msgs"][0]["job_progress"]["progress"], json!(0.52));
        assert!(data["job_msgs"][1].get("job_progress").is_none());
    }

    #[test]
    fn query_and_from_job_message_have_the_documented_shape() {
        let mut writer = JsonProtocolWriter::new();
        writer.append_query_estimate_waiting_time(
            "w0!potential_job17",
            &json!({"res": 1, "walltime": 12.0}),
            10.0,
        );
        writer.append_from_job_message("w0!1", &json!({"token": 5}), 10.0);
        let message = writer.generate_current_message(10.0);
        let doc: Value = serde_json::from_str(&message).unwrap();
        let query = &doc["events"][0]["data"]["requests"]["estimate_waiting_time"];
        assert_eq!(query["job_id"], json!("w0!potential_job17"));
        assert_eq!(query["job"]["res"], json!(1));
        assert_eq!(doc["events"][1]["data"]["msg"]["token"], json!(5));
    }

    #[test]
    fn parses_execute_job_with_mapping() {
        let message = json!({
            "now": 10.0,
            "events": [{
                "timestamp": 10.0,
                "type": "EXECUTE_JOB",
                "data": {
                    "job_id": "w0!1",
                    "alloc": "2-3",
                    "mapping": {"0": "0", "1": "0", "2": "1", "3": "1"}
                }
            }]
        })
        .to_string();
        let reply = parse_message(&message).unwrap();
        assert_eq!(reply.now, 10.0);
        match &reply.events[0].event {
            SchedulerEvent::ExecuteJob { alloc, mapping, .. } => {
                assert_eq!(alloc.to_string_hyphen(" ", "-"), "2-3");
                assert_eq!(mapping, &vec![0, 0, 1, 1]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn rejects_mapping_with_holes_or_out_of_range_values() {
        let message = json!({
            "now": 10.0,
            "events": [{
                "timestamp": 10.0,
                "type": "EXECUTE_JOB",
                "data": {"job_id": "w0!1", "alloc": "2-3", "mapping": {"0": 0, "2": 1}}
            }]
        })
        .to_string();
        assert!(parse_message(&message).is_err());

        let message = json!({
            "now": 10.0,
            "events": [{
                "timestamp": 10.0,
                "type": "EXECUTE_JOB",
                "data": {"job_id": "w0!1", "alloc": "2-3", "mapping": {"0": 5}}
            }]
        })
        .to_string();
        assert!(parse_message(&message).is_err());
    }

    #[test]
    fn rejects_event_after_now() {
        let message = json!({
            "now": 10.0,
            "events": [{
                "timestamp": 11.0,
                "type": "REJECT_JOB",
                "data": {"job_id": "w0!1"}
            }]
        })
        .to_string();
        assert!(matches!(
            parse_message(&message),
            Err(ProtocolError::TimestampAfterNow { .. })
        ));
    }

    #[test]
    fn rejects_reordered_reply_events() {
        let message = json!({
            "now": 10.0,
            "events": [
                {"timestamp": 5.0, "type": "REJECT_JOB", "data": {"job_id": "w0!1"}},
                {"timestamp": 3.0, "type": "REJECT_JOB", "data": {"job_id": "w0!2"}}
            ]
        })
        .to_string();
        assert!(matches!(
            parse_message(&message),
            Err(ProtocolError::NonMonotonicTimestamps { .. })
        ));
    }

    #[test]
    fn rejects_unknown_event_types() {
        let message = json!({
            "now": 1.0,
            "events": [{"timestamp": 1.0, "type": "FROBNICATE", "data": {}}]
        })
        .to_string();
        assert!(matches!(
            parse_message(&message),
            Err(ProtocolError::UnknownEventType(_, _))
        ));
    }

    #[test]
    fn parses_kill_job_and_call_me_later() {
        let message = json!({
            "now": 10.0,
            "events": [
                {"timestamp": 9.0, "type": "KILL_JOB",
                 "data": {"job_msgs": [{"id": "w0!1", "forWhat": 1}]}},
                {"timestamp": 10.0, "type": "CALL_ME_LATER",
                 "data": {"timestamp": 25.5, "id": 2, "forWhat": 0}}
            ]
        })
        .to_string();
        let reply = parse_message(&message).unwrap();
        match &reply.events[0].event {
            SchedulerEvent::KillJob { job_msgs } => {
                assert_eq!(job_msgs[0].job_id, "w0!1");
                assert_eq!(job_msgs[0].for_what, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match &reply.events[1].event {
            SchedulerEvent::CallMeLater {
                target_time,
                id,
                for_what,
            } => {
                assert_eq!(*target_time, 25.5);
                assert_eq!(*id, 2);
                assert_eq!(*for_what, 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_notify_variants() {
        let message = json!({
            "now": 1.0,
            "events": [
                {"timestamp": 1.0, "type": "NOTIFY", "data": {"type": "registration_finished"}},
                {"timestamp": 1.0, "type": "NOTIFY", "data": {"type": "queue_size", "data": "12"}}
            ]
        })
        .to_string();
        let reply = parse_message(&message).unwrap();
        assert!(matches!(
            reply.events[0].event,
            SchedulerEvent::Notify(NotifyEvent::RegistrationFinished)
        ));
        match &reply.events[1].event {
            SchedulerEvent::Notify(NotifyEvent::Scalar { kind, value }) => {
                assert_eq!(kind, "queue_size");
                assert_eq!(value, "12");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
