use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::RenderError;

pub type TemplateParams = BTreeMap<String, Value>;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{ *\.([A-Za-z0-9_]*) *\}\}").unwrap());
static DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\{\{- *(if|range) +\.([A-Za-z0-9_]+) *\}\}$").unwrap());

const ELSE: &str = "{{- else }}";
const END: &str = "{{- end }}";

/// Renders backend templates from a directory.
///
/// Supported syntax:
/// - `{{ .name }}` substitutes a parameter; absent or null parameters are an error.
/// - `{{- if .name }}` / `{{- else }}` / `{{- end }}` on their own lines keep one
///   branch. Absent, null, `false`, `""`, and empty lists are false.
/// - `{{- range .name }}` / `{{- else }}` / `{{- end }}` repeats its body for each
///   element of a list; `{{ .field }}` inside the body reads from the element and
///   `{{ . }}` is the element itself. The else branch renders for an empty list.
///
/// Blocks do not nest.
pub struct TemplateRenderer {
    templates_dir: PathBuf,
}

impl TemplateRenderer {
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
        }
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    /// Render `template_name` and write exactly one file at `output_path`.
    pub fn render(
        &self,
        template_name: &str,
        output_path: &Path,
        params: &TemplateParams,
    ) -> Result<(), RenderError> {
        let mut rendered = self.render_to_string(template_name, params)?;
        rendered.push('\n');

        fs::write(output_path, rendered).map_err(|source| RenderError::Write {
            path: output_path.to_path_buf(),
            source,
        })?;

        debug!(
            "Rendered {} into {}",
            template_name,
            output_path.display()
        );
        Ok(())
    }

    pub fn render_to_string(
        &self,
        template_name: &str,
        params: &TemplateParams,
    ) -> Result<String, RenderError> {
        let template_path = self.templates_dir.join(template_name);
        if !template_path.is_file() {
            return Err(RenderError::TemplateNotFound {
                path: template_path,
            });
        }

        let template = fs::read_to_string(&template_path).map_err(|source| RenderError::Read {
            path: template_path.clone(),
            source,
        })?;

        render_str(template_name, &template, params)
    }
}

/// Render template text that is already in memory.
pub fn render_str(
    template_name: &str,
    template: &str,
    params: &TemplateParams,
) -> Result<String, RenderError> {
    let top_level = |name: &str| params.get(name).map(|v| (name.to_string(), v));
    let mut rendered = Vec::new();
    let mut lines = template.lines();

    while let Some(line) = lines.next() {
        let Some(caps) = DIRECTIVE.captures(line.trim()) else {
            rendered.push(substitute(template_name, line, &top_level)?);
            continue;
        };

        let keyword = caps[1].to_string();
        let key = caps[2].to_string();

        let mut body = Vec::new();
        let mut alternative = Vec::new();
        let mut in_else = false;
        let mut closed = false;

        for inner_line in lines.by_ref() {
            let trimmed = inner_line.trim();
            if trimmed == END {
                closed = true;
                break;
            } else if trimmed == ELSE {
                in_else = true;
            } else if in_else {
                alternative.push(inner_line);
            } else {
                body.push(inner_line);
            }
        }

        if !closed {
            return Err(RenderError::UnterminatedBlock {
                template: template_name.to_string(),
                directive: line.trim().to_string(),
            });
        }

        if keyword == "if" {
            let chosen = if is_truthy(params.get(&key)) {
                body
            } else {
                alternative
            };
            for block_line in chosen {
                rendered.push(substitute(template_name, block_line, &top_level)?);
            }
            continue;
        }

        let items = match params.get(&key) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(_) => {
                return Err(RenderError::InvalidValue {
                    name: key,
                    message: "range requires a list".to_string(),
                })
            }
        };

        if items.is_empty() {
            for block_line in alternative {
                rendered.push(substitute(template_name, block_line, &top_level)?);
            }
            continue;
        }

        for item in items {
            let element = |name: &str| {
                let qualified = format!("{key}.{name}");
                match (name, item) {
                    ("", _) => Some((key.clone(), item)),
                    (_, Value::Object(fields)) => fields.get(name).map(|v| (qualified, v)),
                    _ => None,
                }
            };
            for block_line in &body {
                rendered.push(substitute(template_name, block_line, &element)?);
            }
        }
    }

    Ok(rendered.join("\n"))
}

fn substitute<'a, F>(template_name: &str, line: &str, lookup: &F) -> Result<String, RenderError>
where
    F: Fn(&str) -> Option<(String, &'a Value)>,
{
    let mut result = String::with_capacity(line.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(line) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let name = &caps[1];
        result.push_str(&line[last..whole.start()]);

        match lookup(name) {
            Some((qualified, value)) if !value.is_null() => {
                result.push_str(&value_to_string(value, &qualified)?);
            }
            _ => {
                return Err(RenderError::MissingParameter {
                    template: template_name.to_string(),
                    name: name.to_string(),
                })
            }
        }
        last = whole.end();
    }

    result.push_str(&line[last..]);
    Ok(result)
}

fn value_to_string(value: &Value, key: &str) -> Result<String, RenderError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Array(arr) => {
            let strings: Result<Vec<String>, RenderError> = arr
                .iter()
                .map(|v| match v {
                    Value::Array(_) | Value::Object(_) | Value::Null => {
                        Err(RenderError::InvalidValue {
                            name: key.to_string(),
                            message: "list elements must be scalars".to_string(),
                        })
                    }
                    scalar => value_to_string(scalar, key),
                })
                .collect();
            Ok(strings?.join(","))
        }
        Value::Object(_) => Err(RenderError::InvalidValue {
            name: key.to_string(),
            message: "object values cannot be directly substituted".to_string(),
        }),
        Value::Null => Err(RenderError::InvalidValue {
            name: key.to_string(),
            message: "null".to_string(),
        }),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(Value::Number(_)) => true,
    }
}
