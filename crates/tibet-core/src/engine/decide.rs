//! What should happen next to a job, decided from the document alone.
//!
//! `decide` は純粋関数: store にも時計にも触れない。同じドキュメントからは
//! どの worker でも同じ判断になる。

use crate::domain::{Job, StepRole, StepState, TaskRef};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// A step is in flight; nothing to do.
    Wait,
    /// Claim this sequence task as the next step.
    Accept(TaskRef),
    /// Append a retry of the step at this index.
    RetryStep(usize),
    /// The step at this index failed for good: run its error handler or
    /// escalate to the job.
    CleanupTask(usize),
    /// The task-level handler for the failed step at this index has finished;
    /// escalate to the job.
    EscalateJob(usize),
    /// Nothing left in the sequence (or the run was interrupted).
    Finish,
}

pub fn decide(job: &Job) -> Decision {
    let run = job.run_steps();
    let sequence = job.sequence();

    let Some(last) = run.last() else {
        return sequence
            .first()
            .cloned()
            .map_or(Decision::Finish, Decision::Accept);
    };
    if last.state.is_active() {
        return Decision::Wait;
    }

    match last.role {
        StepRole::Cleanup => Decision::Finish,
        StepRole::Error => {
            let failed = run
                .iter()
                .rev()
                .find(|s| s.role.is_task())
                .map_or(last.index, |s| s.index);
            Decision::EscalateJob(failed)
        }
        StepRole::Task => match last.state {
            StepState::Timeout | StepState::Error if last.retry > 0 => Decision::RetryStep(last.index),
            StepState::Timeout | StepState::Error | StepState::Failed => Decision::CleanupTask(last.index),
            StepState::Complete | StepState::Skipped => {
                // an unretried $$error owns further progress
                let interrupted = run.iter().any(|s| {
                    s.role.is_task()
                        && s.state == StepState::Error
                        && !run.iter().any(|r| r.retry_of == Some(s.index))
                });
                if interrupted {
                    return Decision::Finish;
                }
                let consumed = run
                    .iter()
                    .filter(|s| s.role.is_task() && s.state.is_done())
                    .count();
                sequence
                    .get(consumed)
                    .cloned()
                    .map_or(Decision::Finish, Decision::Accept)
            }
            StepState::Ready | StepState::Active => Decision::Wait,
        },
    }
}
