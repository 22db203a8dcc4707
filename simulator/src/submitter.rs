//! Static-workload submission actor.
//!
//! Walks every static workload's jobs in submission order and emits one
//! submission event per job at its submission time, then tells the server
//! that no more static jobs will ever arrive.

use std::cell::RefCell;
use std::rc::Rc;

use dslab_core::{log_info, Id, SimulationContext};

use crate::events::{JobSubmittedEvent, SubmitterDone};
use crate::workload::Workloads;

pub struct JobSubmitter {
    workloads: Rc<RefCell<Workloads>>,
    server_id: Id,
    ctx: SimulationContext,
}

impl JobSubmitter {
    pub fn new(ctx: SimulationContext, workloads: Rc<RefCell<Workloads>>) -> JobSubmitter {
        JobSubmitter {
            workloads,
            server_id: u32::MAX, // set by the simulation builder
            ctx,
        }
    }

    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    pub fn set_server(&mut self, server_id: Id) {
        self.server_id = server_id;
    }

    /// Emits the whole static job stream. Jobs restored from a checkpoint
    /// in a terminal state are not re-submitted; live restored jobs whose
    /// submission time already passed go out at the current time.
    pub fn submit_workloads(&self) {
        let now = self.ctx.time();
        let mut submissions: Vec<(f64, String)> = Vec::new();
        {
            let workloads = self.workloads.borrow();
            for workload in workloads.iter().filter(|w| w.is_static()) {
                for id in workload.jobs.ids_sorted_by_submission() {
                    let job = workload.jobs.get(&id).unwrap();
                    if job.state.is_terminal() {
                        continue;
                    }
                    submissions.push((job.submission_time.max(now), id.to_string()));
                }
            }
        }
        submissions.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let count = submissions.len();
        let mut last_time = now;
        for (time, job_id) in submissions {
            self.ctx.emit_ordered(
                JobSubmittedEvent { job_id },
                self.server_id,
                time - now,
            );
            last_time = time;
        }
        self.ctx
            .emit_ordered(SubmitterDone {}, self.server_id, last_time - now);
        log_info!(self.ctx, "submitter armed {} static jobs", count);
    }
}
