//! Template pass over parameter values.
//!
//! - `{{ root.path }}` is evaluated now. `root` is `job`, `step` or `params`.
//! - A string that is exactly one `{{ }}` expression becomes the referenced
//!   value itself (numbers stay numbers, objects stay objects).
//! - Otherwise each expression is interpolated as text; a missing value is "".
//! - `[[ root.path ]]` is left for the runner: it is rewritten to `{{ root.path }}`
//!   and evaluated by [`render_deferred`] at run time. `[[` that does not wrap a
//!   valid path (shell tests like `[[ -f x ]]`) is plain text.

use serde_json::{Map, Value};

use super::ResolveError;
use super::path::get_path;

#[derive(Debug, Clone, Copy)]
pub struct TemplateScope<'a> {
    pub job: &'a Value,
    pub step: &'a Value,
    pub params: &'a Value,
}

impl<'a> TemplateScope<'a> {
    fn lookup(&self, expr: &Expr<'_>) -> Option<&'a Value> {
        let root = match expr.root {
            "job" => self.job,
            "step" => self.step,
            _ => self.params,
        };
        get_path(root, expr.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Expr<'s> {
    source: &'s str,
    root: &'s str,
    path: &'s str,
}

#[derive(Debug, PartialEq)]
enum Segment<'s> {
    Text(&'s str),
    Now(Expr<'s>),
    Deferred(Expr<'s>),
}

fn parse_expr(source: &str) -> Result<Expr<'_>, ResolveError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(ResolveError::InvalidExpression(source.to_string()));
    }
    let (root, path) = source.split_once('.').unwrap_or((source, ""));
    if !matches!(root, "job" | "step" | "params") {
        return Err(ResolveError::UnknownRoot(root.to_string()));
    }
    let valid_segment =
        |s: &str| !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || "_-$".contains(c));
    if !path.is_empty() && !path.split('.').all(valid_segment) {
        return Err(ResolveError::InvalidExpression(source.to_string()));
    }
    Ok(Expr { source, root, path })
}

fn parse(input: &str) -> Result<Vec<Segment<'_>>, ResolveError> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while cursor < input.len() {
        let rest = &input[cursor..];
        let next_now = rest.find("{{");
        let next_deferred = rest.find("[[");
        let (at, deferred) = match (next_now, next_deferred) {
            (Some(a), Some(b)) if b < a => (b, true),
            (Some(a), _) => (a, false),
            (None, Some(b)) => (b, true),
            (None, None) => break,
        };
        let open = cursor + at;
        let close_token = if deferred { "]]" } else { "}}" };
        let inner_start = open + 2;
        let close = input[inner_start..].find(close_token).map(|i| inner_start + i);

        if deferred {
            match close.map(|c| (c, parse_expr(&input[inner_start..c]))) {
                Some((c, Ok(expr))) => {
                    if text_start < open {
                        segments.push(Segment::Text(&input[text_start..open]));
                    }
                    segments.push(Segment::Deferred(expr));
                    cursor = c + 2;
                    text_start = cursor;
                }
                _ => cursor = inner_start,
            }
            continue;
        }

        let Some(close) = close else {
            return Err(ResolveError::Unterminated { at: open });
        };
        let expr = parse_expr(&input[inner_start..close])?;
        if text_start < open {
            segments.push(Segment::Text(&input[text_start..open]));
        }
        segments.push(Segment::Now(expr));
        cursor = close + 2;
        text_start = cursor;
    }
    if text_start < input.len() {
        segments.push(Segment::Text(&input[text_start..]));
    }
    Ok(segments)
}

fn as_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Renders one string leaf.
pub fn render_str(input: &str, scope: &TemplateScope<'_>) -> Result<Value, ResolveError> {
    let segments = parse(input)?;
    match segments.as_slice() {
        [Segment::Now(expr)] => {
            return Ok(scope.lookup(expr).cloned().unwrap_or(Value::Null));
        }
        s if s.iter().all(|seg| matches!(seg, Segment::Text(_))) => {
            return Ok(Value::String(input.to_string()));
        }
        _ => {}
    }

    let mut out = String::with_capacity(input.len());
    for segment in &segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Now(expr) => out.push_str(&as_text(scope.lookup(expr))),
            Segment::Deferred(expr) => {
                out.push_str("{{ ");
                out.push_str(expr.source);
                out.push_str(" }}");
            }
        }
    }
    Ok(Value::String(out))
}

/// Renders every string leaf of `value`. Object keys are not templated.
pub fn render_value(value: &Value, scope: &TemplateScope<'_>) -> Result<Value, ResolveError> {
    Ok(match value {
        Value::String(s) => render_str(s, scope)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, scope))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), render_value(item, scope)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Second pass, run by a runner over the params it received: evaluates the
/// expressions that were written as `[[ ]]` in the task definition.
pub fn render_deferred(value: &Value, scope: &TemplateScope<'_>) -> Result<Value, ResolveError> {
    render_value(value, scope)
}
