//! IdGenerator port
//!
//! worker 同士は調整なしで採番するので ULID（時刻 + 乱数）を使う。

use crate::domain::ids::{JobId, WorkerId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    /// `_id` for a job submitted without one.
    fn generate_job_id(&self) -> JobId;

    /// Identity of this worker process when none is configured.
    fn generate_worker_id(&self) -> WorkerId;
}

/// Takes the timestamp part from `clock`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let millis = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(millis, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        self.next_ulid().into()
    }

    fn generate_worker_id(&self) -> WorkerId {
        self.next_ulid().into()
    }
}
