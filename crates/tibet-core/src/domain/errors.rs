//! Errors - エラーの運用分類
//!
//! 個々のエラー型は発生するモジュール側で `thiserror` の enum として定義し、
//! ここではそれらを「どう扱うか」で分類する。

use std::fmt;

/// ErrorKind は engine から見たエラーの扱い
///
/// - Configuration: flow / task / plugin の設定不備。Job を `$$failed` にし、リトライしない
/// - Transient: runner の失敗やタイムアウト。retry budget の範囲で再試行
/// - Conflict: revision の不一致。Job の失敗ではなく、読み直して判断し直す
/// - Resolution: パラメータ解決の失敗。Step を `$$error` として積む
/// - Infrastructure: store との通信やデコードの失敗
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Transient,
    Conflict,
    Resolution,
    Infrastructure,
}

impl ErrorKind {
    /// Whether the same operation may succeed if simply tried again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Conflict | Self::Infrastructure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Transient => "transient",
            Self::Conflict => "conflict",
            Self::Resolution => "resolution",
            Self::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}
