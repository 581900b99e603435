//! ChangeFeed port - ストアの変更通知
//!
//! `since` から始まる順序付きの変更列を購読する。heartbeat は「接続は生きているが
//! 変更はない」ことを示すだけで、watcher はこれが途切れたら再接続する。

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::document_store::{Document, StoreError};

/// Where a subscription starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Since {
    /// Only changes made after subscribing.
    #[default]
    Now,
    /// Changes after this sequence token.
    Seq(String),
}

impl FromStr for Since {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "now" => Self::Now,
            seq => Self::Seq(seq.to_string()),
        })
    }
}

impl fmt::Display for Since {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Now => f.write_str("now"),
            Self::Seq(seq) => f.write_str(seq),
        }
    }
}

/// One document mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub seq: String,
    pub id: String,
    pub doc: Option<Document>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(Change),
    Heartbeat,
}

/// An open subscription.
#[async_trait]
pub trait ChangeSubscription: Send {
    /// Next event; `Ok(None)` when the feed was closed by the other side.
    async fn next(&mut self) -> Result<Option<FeedEvent>, StoreError>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(
        &self,
        since: &Since,
        heartbeat: Duration,
    ) -> Result<Box<dyn ChangeSubscription>, StoreError>;
}
