use std::collections::BTreeMap;

use serde_json::{json, Value};
use thiserror::Error;

use crate::interval_set::IntervalSet;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("invalid platform file '{0}': {1}")]
    Invalid(String, String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    Computing,
    SwitchingOn,
    SwitchingOff,
    Sleeping,
    Unavailable,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Idle => "idle",
            MachineState::Computing => "computing",
            MachineState::SwitchingOn => "switching_on",
            MachineState::SwitchingOff => "switching_off",
            MachineState::Sleeping => "sleeping",
            MachineState::Unavailable => "unavailable",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineRole {
    Compute,
    Storage,
    Master,
}

pub struct Machine {
    pub id: u32,
    pub name: String,
    pub state: MachineState,
    pub core_count: u32,
    /// Computation speed in flop/s.
    pub speed: f64,
    pub repair_time: f64,
    pub watts: f64,
    pub properties: BTreeMap<String, String>,
    pub zone_properties: BTreeMap<String, String>,
    pub role: MachineRole,
    pub pstate: i32,

    nb_jobs_running: u32,
    consumed_energy: f64,
}

impl Machine {
    pub fn to_json_value(&self) -> Value {
        let properties: Value = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect::<serde_json::Map<String, Value>>()
            .into();
        let zone_properties: Value = self
            .zone_properties
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect::<serde_json::Map<String, Value>>()
            .into();
        json!({
            "id": self.id,
            "name": self.name,
            "state": self.state.as_str(),
            "core_count": self.core_count,
            "speed": self.speed,
            "repair-time": self.repair_time,
            "properties": properties,
            "zone_properties": zone_properties,
        })
    }
}

/// The machine inventory, fixed at initialization.
///
/// Machine ids form the contiguous range `[0, nb_machines)`. The master
/// host runs the server and is excluded from the compute subset.
pub struct Machines {
    machines: Vec<Machine>,
}

impl Machines {
    /// Builds the roster from the platform description, an object with a
    /// `hosts` array and an optional `master_host` name. The platform's
    /// physics (links, energy curves) are the simulation backend's concern
    /// and are ignored here.
    pub fn from_platform_json(
        file: &str,
        doc: &Value,
        master_host_name: &str,
        limit_machines_count: Option<u32>,
    ) -> Result<Machines, PlatformError> {
        let hosts = doc
            .get("hosts")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                PlatformError::Invalid(file.to_string(), "the 'hosts' array is missing".to_string())
            })?;

        let mut machines = Vec::with_capacity(hosts.len());
        let mut nb_compute = 0u32;
        for host in hosts {
            let name = host
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    PlatformError::Invalid(
                        file.to_string(),
                        "a host has no 'name' field".to_string(),
                    )
                })?
                .to_string();
            let speed = host.get("speed").and_then(Value::as_f64).unwrap_or(1e9);
            if speed <= 0.0 {
                return Err(PlatformError::Invalid(
                    file.to_string(),
                    format!("host '{}' has a non-positive speed", name),
                ));
            }
            let role = match host.get("role").and_then(Value::as_str) {
                Some("storage") => MachineRole::Storage,
                Some("master") => MachineRole::Master,
                _ if name == master_host_name => MachineRole::Master,
                _ => MachineRole::Compute,
            };
            if role == MachineRole::Compute {
                if let Some(limit) = limit_machines_count {
                    if nb_compute >= limit {
                        continue;
                    }
                }
                nb_compute += 1;
            }
            let properties = host
                .get("properties")
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            machines.push(Machine {
                id: machines.len() as u32,
                name,
                state: MachineState::Idle,
                core_count: host.get("core_count").and_then(Value::as_u64).unwrap_or(1) as u32,
                speed,
                repair_time: host.get("repair_time").and_then(Value::as_f64).unwrap_or(0.0),
                watts: host.get("watts").and_then(Value::as_f64).unwrap_or(100.0),
                properties,
                zone_properties: BTreeMap::new(),
                role,
                pstate: 0,
                nb_jobs_running: 0,
                consumed_energy: 0.0,
            });
        }

        if machines.iter().all(|m| m.role != MachineRole::Compute) {
            return Err(PlatformError::Invalid(
                file.to_string(),
                "the platform contains no compute host".to_string(),
            ));
        }
        Ok(Machines { machines })
    }

    pub fn nb_machines(&self) -> u32 {
        self.machines.len() as u32
    }

    pub fn nb_compute_machines(&self) -> u32 {
        self.compute_machines().count() as u32
    }

    pub fn nb_storage_machines(&self) -> u32 {
        self.machines
            .iter()
            .filter(|m| m.role == MachineRole::Storage)
            .count() as u32
    }

    pub fn compute_machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter().filter(|m| m.role == MachineRole::Compute)
    }

    pub fn storage_machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter().filter(|m| m.role == MachineRole::Storage)
    }

    pub fn get(&self, id: u32) -> Option<&Machine> {
        self.machines.get(id as usize)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Machine> {
        self.machines.get_mut(id as usize)
    }

    /// Whether every machine of the allocation exists and can run a job now.
    pub fn allocation_available(&self, allocation: &IntervalSet) -> bool {
        allocation.iter().all(|id| {
            self.get(id).is_some_and(|m| {
                m.role == MachineRole::Compute
                    && matches!(m.state, MachineState::Idle | MachineState::Computing)
            })
        })
    }

    /// Whether no machine of the allocation currently runs a job; checked
    /// when compute sharing is disabled.
    pub fn allocation_free_of_jobs(&self, allocation: &IntervalSet) -> bool {
        allocation
            .iter()
            .all(|id| self.get(id).map_or(false, |m| m.nb_jobs_running == 0))
    }

    pub fn allocation_within_range(&self, allocation: &IntervalSet) -> bool {
        allocation.iter().all(|id| (id as usize) < self.machines.len())
    }

    pub fn update_machines_on_job_start(&mut self, allocation: &IntervalSet) {
        for id in allocation.iter() {
            if let Some(machine) = self.machines.get_mut(id as usize) {
                machine.nb_jobs_running += 1;
                if machine.state == MachineState::Idle {
                    machine.state = MachineState::Computing;
                }
            }
        }
    }

    pub fn update_machines_on_job_end(&mut self, allocation: &IntervalSet, runtime: f64) {
        for id in allocation.iter() {
            if let Some(machine) = self.machines.get_mut(id as usize) {
                machine.nb_jobs_running = machine.nb_jobs_running.saturating_sub(1);
                machine.consumed_energy += machine.watts * runtime.max(0.0);
                if machine.nb_jobs_running == 0 && machine.state == MachineState::Computing {
                    machine.state = MachineState::Idle;
                }
            }
        }
    }

    pub fn set_unavailable(&mut self, id: u32) {
        if let Some(machine) = self.machines.get_mut(id as usize) {
            machine.state = MachineState::Unavailable;
        }
    }

    pub fn set_available(&mut self, id: u32) {
        if let Some(machine) = self.machines.get_mut(id as usize) {
            machine.state = if machine.nb_jobs_running > 0 {
                MachineState::Computing
            } else {
                MachineState::Idle
            };
        }
    }

    /// Applies a scheduler-requested power-state change. The physics of the
    /// transition belong to the simulation backend; the roster only records
    /// the state.
    pub fn set_pstate(&mut self, allocation: &IntervalSet, pstate: i32) {
        for id in allocation.iter() {
            if let Some(machine) = self.machines.get_mut(id as usize) {
                machine.pstate = pstate;
            }
        }
    }

    /// Energy consumed so far by jobs, over all machines, in joules.
    pub fn total_consumed_energy(&self) -> f64 {
        self.machines.iter().map(|m| m.consumed_energy).sum()
    }

    /// The energy a job consumes on its allocation over `runtime` seconds.
    pub fn job_energy_estimate(&self, allocation: &IntervalSet, runtime: f64) -> f64 {
        allocation
            .iter()
            .filter_map(|id| self.get(id))
            .map(|m| m.watts * runtime.max(0.0))
            .sum()
    }

    /// The slowest speed among the allocated machines, used to size
    /// parallel-homogeneous leaf durations.
    pub fn min_speed(&self, allocation: &IntervalSet) -> f64 {
        allocation
            .iter()
            .filter_map(|id| self.get(id))
            .map(|m| m.speed)
            .fold(f64::INFINITY, f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(nb: usize) -> Machines {
        let hosts: Vec<Value> = (0..nb)
            .map(|i| json!({"name": format!("host{}", i), "speed": 1e9}))
            .collect();
        let doc = json!({"hosts": hosts});
        Machines::from_platform_json("p.json", &doc, "master_host", None).unwrap()
    }

    #[test]
    fn ids_form_a_contiguous_range() {
        let machines = platform(4);
        assert_eq!(machines.nb_machines(), 4);
        for i in 0..4 {
            assert_eq!(machines.get(i).unwrap().id, i);
        }
    }

    #[test]
    fn master_host_is_excluded_from_compute() {
        let doc = json!({"hosts": [
            {"name": "master_host", "speed": 1e9},
            {"name": "host0", "speed": 1e9},
            {"name": "store", "speed": 1e9, "role": "storage"},
        ]});
        let machines = Machines::from_platform_json("p.json", &doc, "master_host", None).unwrap();
        assert_eq!(machines.nb_machines(), 3);
        assert_eq!(machines.nb_compute_machines(), 1);
        assert_eq!(machines.nb_storage_machines(), 1);
    }

    #[test]
    fn job_bookkeeping_toggles_states_and_energy() {
        let mut machines = platform(3);
        let alloc = IntervalSet::from_string_hyphen("0-1", " ", "-").unwrap();
        machines.update_machines_on_job_start(&alloc);
        assert_eq!(machines.get(0).unwrap().state, MachineState::Computing);
        assert_eq!(machines.get(2).unwrap().state, MachineState::Idle);
        machines.update_machines_on_job_end(&alloc, 10.0);
        assert_eq!(machines.get(0).unwrap().state, MachineState::Idle);
        assert_eq!(machines.total_consumed_energy(), 2.0 * 100.0 * 10.0);
    }

    #[test]
    fn unavailable_machines_fail_the_allocation_check() {
        let mut machines = platform(2);
        let alloc = IntervalSet::from_string_hyphen("0-1", " ", "-").unwrap();
        assert!(machines.allocation_available(&alloc));
        machines.set_unavailable(1);
        assert!(!machines.allocation_available(&alloc));
        machines.set_available(1);
        assert!(machines.allocation_available(&alloc));
    }

    #[test]
    fn mmax_caps_the_compute_roster() {
        let hosts: Vec<Value> = (0..5)
            .map(|i| json!({"name": format!("host{}", i), "speed": 1e9}))
            .collect();
        let doc = json!({"hosts": hosts});
        let machines = Machines::from_platform_json("p.json", &doc, "master_host", Some(3)).unwrap();
        assert_eq!(machines.nb_compute_machines(), 3);
    }
}
