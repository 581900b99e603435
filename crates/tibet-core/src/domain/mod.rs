//! Domain model: definitions (flow / task), jobs and steps, states, ids.
//!
//! ここには I/O を含めない。store や runner とのやりとりは `ports` / `engine` 側。

pub mod blend;
pub mod errors;
pub mod flow;
pub mod ids;
pub mod job;
pub mod state;
pub mod task;

pub use blend::{blend, blended};
pub use errors::ErrorKind;
pub use flow::{DEFAULT_OWNER, Flow, TaskRef, TaskStructure, definition_key};
pub use ids::{Id, IdMarker, JobId, ParseIdError, WorkerId};
pub use job::{ExitCode, Job, Step, StepRole};
pub use state::{JobState, StepState, UnknownStepState};
pub use task::{Guard, TaskDef};
