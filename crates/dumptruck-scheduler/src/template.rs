//! Template resolution for task arguments and environment values.
//!
//! A templated string holds literal text plus `{{ expr }}` segments:
//!
//! ```text
//! {{ var.value.pg_host }}                      required variable
//! {{ var.value.pg_port | default('5432') }}    variable with fallback
//! {{ ds }}  {{ ts }}  {{ run_id }}             run context
//! ```
//!
//! Values that came from secret-looking keys are reported back so callers
//! can mask them in logs (see [`Redactor`]).

use chrono::{DateTime, SecondsFormat, Utc};
use dumptruck_core::error::{DumptruckError, Result};

use crate::variables::VariableStore;

const SECRET_MARKERS: [&str; 5] = ["password", "secret", "token", "key", "credential"];
const MASK: &str = "***";

/// Everything a template can see during one run.
pub struct TemplateContext<'a> {
    pub vars: &'a dyn VariableStore,
    pub logical_date: DateTime<Utc>,
    pub run_id: &'a str,
}

/// A rendered string plus any secret values that went into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub value: String,
    pub secrets: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Expr {
    Var { key: String, default: Option<String> },
    Ds,
    Ts,
    RunId,
}

/// Render every `{{ ... }}` segment in `template`.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<Rendered> {
    let mut value = String::with_capacity(template.len());
    let mut secrets = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        value.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = find_close(after_open)
            .ok_or_else(|| DumptruckError::Template(format!("unclosed '{{{{' in '{template}'")))?;

        match parse_expr(&after_open[..close])? {
            Expr::Var { key, default } => match ctx.vars.get(&key) {
                Some(v) => {
                    if is_secret_key(&key) && !v.is_empty() {
                        secrets.push(v.clone());
                    }
                    value.push_str(&v);
                }
                None => match default {
                    Some(d) => value.push_str(&d),
                    None => return Err(DumptruckError::UnresolvedVariable(key)),
                },
            },
            Expr::Ds => value.push_str(&ctx.logical_date.format("%Y-%m-%d").to_string()),
            Expr::Ts => value.push_str(&ctx.logical_date.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Expr::RunId => value.push_str(ctx.run_id),
        }
        rest = &after_open[close + 2..];
    }
    value.push_str(rest);

    Ok(Rendered { value, secrets })
}

/// Variable keys a template references, with whether each has a default.
pub fn referenced_variables(template: &str) -> Result<Vec<(String, bool)>> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let close = find_close(after_open)
            .ok_or_else(|| DumptruckError::Template(format!("unclosed '{{{{' in '{template}'")))?;
        if let Expr::Var { key, default } = parse_expr(&after_open[..close])? {
            found.push((key, default.is_some()));
        }
        rest = &after_open[close + 2..];
    }
    Ok(found)
}

fn parse_expr(raw: &str) -> Result<Expr> {
    let (head, filter) = match split_pipe(raw) {
        Some((head, filter)) => (head.trim(), Some(filter.trim())),
        None => (raw.trim(), None),
    };

    let default = match filter {
        Some(f) => Some(parse_default(f)?),
        None => None,
    };

    let expr = match head {
        "ds" => Expr::Ds,
        "ts" => Expr::Ts,
        "run_id" => Expr::RunId,
        _ => {
            let key = head.strip_prefix("var.value.").ok_or_else(|| {
                DumptruckError::Template(format!("unsupported expression '{}'", raw.trim()))
            })?;
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(DumptruckError::Template(format!("invalid variable name '{key}'")));
            }
            return Ok(Expr::Var {
                key: key.to_string(),
                default,
            });
        }
    };

    if default.is_some() {
        return Err(DumptruckError::Template(format!(
            "default() only applies to variables: '{}'",
            raw.trim()
        )));
    }
    Ok(expr)
}

/// Split on the first `|` that is not inside quotes.
fn split_pipe(raw: &str) -> Option<(&str, &str)> {
    let mut quote: Option<char> = None;
    for (i, c) in raw.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '|') => return Some((&raw[..i], &raw[i + 1..])),
            _ => {}
        }
    }
    None
}

/// Byte offset of the first `}}` that is not inside quotes.
fn find_close(raw: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in raw.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '}') if raw[i..].starts_with("}}") => return Some(i),
            _ => {}
        }
    }
    None
}

/// `default('literal')` or `default("literal")`.
fn parse_default(filter: &str) -> Result<String> {
    let bad = || DumptruckError::Template(format!("unsupported filter '{filter}'"));
    let args = filter
        .strip_prefix("default")
        .map(str::trim_start)
        .and_then(|s| s.strip_prefix('('))
        .and_then(|s| s.trim_end().strip_suffix(')'))
        .map(str::trim)
        .ok_or_else(bad)?;

    let mut chars = args.chars();
    let quote = chars.next().filter(|c| *c == '\'' || *c == '"').ok_or_else(bad)?;
    let inner = args[1..].strip_suffix(quote).ok_or_else(bad)?;
    if inner.contains(quote) {
        return Err(bad());
    }
    Ok(inner.to_string())
}

/// Whether a variable name looks like it holds a credential.
pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|m| lower.contains(m))
}

/// Masks known secret values in log output.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        let mut secrets: Vec<String> = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        // Longest first so a secret containing another is masked whole
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
    }
}
