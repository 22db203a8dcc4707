//! Top-level simulation assembly: builds the components on a dslab
//! `Simulation`, wires their ids together and drives the run to completion.

use std::cell::RefCell;
use std::rc::Rc;

use sugars::{rc, refcell};
use thiserror::Error;

use dslab_core::async_mode::EventKey;
use dslab_core::Simulation;

use crate::batsim_checkpoint::CheckpointManager;
use crate::config::sim_config::SimulationConfig;
use crate::events::{KillJobSignal, SimulationStart};
use crate::jobs_execution::JobExecutor;
use crate::machines::Machines;
use crate::protocol::SchedulerClient;
use crate::server::Server;
use crate::storage::SharedExecutionStorage;
use crate::submitter::JobSubmitter;
use crate::workload::Workloads;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("{0}")]
    Protocol(String),
}

pub struct BatsimSimulation {
    sim: Simulation,

    server: Rc<RefCell<Server>>,
    executor: Rc<RefCell<JobExecutor>>,
    submitter: Rc<RefCell<JobSubmitter>>,

    workloads: Rc<RefCell<Workloads>>,
}

impl BatsimSimulation {
    pub fn new(
        mut sim: Simulation,
        config: Rc<SimulationConfig>,
        config_json: serde_json::Value,
        workloads: Workloads,
        machines: Machines,
        client: Box<dyn SchedulerClient>,
        checkpoint: CheckpointManager,
    ) -> BatsimSimulation {
        let workloads = rc!(refcell!(workloads));
        let machines = rc!(refcell!(machines));
        let storage = rc!(refcell!(SharedExecutionStorage::new()));

        let server_ctx = sim.create_context("server");
        let server = rc!(refcell!(Server::new(
            server_ctx,
            config.clone(),
            config_json,
            workloads.clone(),
            machines.clone(),
            storage.clone(),
            client,
            checkpoint,
            1,
        )));
        let server_id = sim.add_handler("server", server.clone());

        let executor_ctx = sim.create_context("job_executor");
        let executor = rc!(refcell!(JobExecutor::new(
            executor_ctx,
            workloads.clone(),
            machines.clone(),
            storage.clone(),
            config.reference_bandwidth,
        )));
        let executor_id = sim.add_handler("job_executor", executor.clone());

        let submitter_ctx = sim.create_context("submitter");
        let submitter = rc!(refcell!(JobSubmitter::new(
            submitter_ctx,
            workloads.clone(),
        )));

        server.borrow_mut().set_executor(executor_id);
        executor.borrow_mut().set_server(server_id);
        submitter.borrow_mut().set_server(server_id);

        sim.register_key_getter_for::<KillJobSignal>(|e| e.execution_id as EventKey);

        BatsimSimulation {
            sim,
            server,
            executor,
            submitter,
            workloads,
        }
    }

    pub fn workloads(&self) -> Rc<RefCell<Workloads>> {
        self.workloads.clone()
    }

    pub fn run(&mut self) -> Result<(), SimulationError> {
        let launcher = self.sim.create_context("launcher");
        launcher.emit_now(SimulationStart {}, self.server.borrow().id());
        self.submitter.borrow().submit_workloads();

        let t = std::time::Instant::now();
        self.sim.step_until_no_events();
        let elapsed = t.elapsed().as_secs_f64();

        let server = self.server.borrow();
        if let Some(error) = server.fatal_error() {
            return Err(SimulationError::Protocol(error.to_string()));
        }
        println!("Simulation finished in {:.3}s (wall-clock)", elapsed);
        println!("Simulation finished at: {}", self.sim.time());
        println!("Completed jobs: {}", server.nb_completed_jobs());
        println!(
            "Processed {} events: {}/s",
            self.sim.event_count(),
            (self.sim.event_count() as f64 / elapsed.max(1e-9)) as u64
        );
        Ok(())
    }

    pub fn job_executor(&self) -> Rc<RefCell<JobExecutor>> {
        self.executor.clone()
    }
}
