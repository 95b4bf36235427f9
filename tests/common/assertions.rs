//! Custom assertions over job executions and events

use grade_batch::{BatchStatus, Event, JobExecution, StepExecution};
use tokio::sync::broadcast;

/// The named step, or a panic listing the steps that did run
pub fn step<'a>(execution: &'a JobExecution, name: &str) -> &'a StepExecution {
    execution.step(name).unwrap_or_else(|| {
        let ran: Vec<_> = execution.steps.iter().map(|s| s.step_name.as_str()).collect();
        panic!("step {name} did not run; ran {ran:?}")
    })
}

/// Assert a step finished with the given status and write count
pub fn assert_step(execution: &JobExecution, name: &str, status: BatchStatus, write_count: u64) {
    let step = step(execution, name);
    assert_eq!(step.status, status, "status of {name}: {:?}", step.exit_message);
    assert_eq!(step.write_count, write_count, "write_count of {name}");
}

/// Drain every event already queued on the receiver
pub fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}
