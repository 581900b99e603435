//! Parameter Resolver.
//!
//! stdio remap と template の解決はどちらも純粋なデータ変換で、I/O を持たない。
//! 失敗は step 受理時のエラー（`$$error` の step）として扱われる。

pub mod path;
pub mod resolver;
pub mod template;

pub use path::{get_path, set_path};
pub use resolver::{ResolvedParams, StepInputs, previous_output, resolve};
pub use template::{TemplateScope, render_deferred, render_str, render_value};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unterminated template expression starting at byte {at}")]
    Unterminated { at: usize },

    #[error("template refers to unknown root `{0}` (expected job, step or params)")]
    UnknownRoot(String),

    #[error("invalid template expression `{0}`")]
    InvalidExpression(String),

    #[error("cannot write through a non-object value at `{0}`")]
    PathBlocked(String),

    #[error("empty destination path")]
    EmptyPath,

    #[error("parameters did not resolve to an object")]
    NotAnObject,

    #[error("cannot encode document for resolution: {0}")]
    Encode(#[from] serde_json::Error),
}
