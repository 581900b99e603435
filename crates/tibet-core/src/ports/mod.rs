//! Ports - 外部との境界
//!
//! Engine はここに定義された trait だけを通してストア・変更通知・時刻・採番・
//! guard 評価に触れる。実装は `impls`（memory / couch）と `guard` にある。

pub mod change_feed;
pub mod clock;
pub mod document_store;
pub mod guard;
pub mod id_generator;

pub use self::change_feed::{Change, ChangeFeed, ChangeSubscription, FeedEvent, Since};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::document_store::{
    ACTIVE_JOBS_VIEW, Document, DocumentStore, FLOWS_VIEW, Revision, StoreError, TASKS_VIEW,
    document_id,
};
pub use self::guard::{GuardError, GuardEvaluator, GuardScope};
pub use self::id_generator::{IdGenerator, UlidGenerator};
