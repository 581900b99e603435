//! Identifiers this process mints itself.
//!
//! Job document の `_id` は投入側が任意の文字列で決めてよいので、文書上は
//! `String` のまま。ここの型は engine / HTTP 層が自分で採番するときだけ使う。
//! 表記は `<prefix><ulid>`（`job-01J...`, `worker-01J...`）。

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Per-kind prefix of a generated id.
pub trait IdMarker: Send + Sync + 'static {
    const PREFIX: &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _kind: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _kind: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::PREFIX, self.ulid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    #[error("expected an id starting with `{expected}`: {raw}")]
    Prefix { expected: &'static str, raw: String },

    #[error("invalid ulid in {raw}")]
    Ulid { raw: String },
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let ulid = raw.strip_prefix(T::PREFIX).ok_or_else(|| ParseIdError::Prefix {
            expected: T::PREFIX,
            raw: raw.to_string(),
        })?;
        Ulid::from_string(ulid)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError::Ulid { raw: raw.to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKind {}

impl IdMarker for JobKind {
    const PREFIX: &'static str = "job-";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerKind {}

impl IdMarker for WorkerKind {
    const PREFIX: &'static str = "worker-";
}

/// `_id` minted for a job submitted without one.
pub type JobId = Id<JobKind>;

/// Worker identity; ends up in `step.pid`.
pub type WorkerId = Id<WorkerKind>;
