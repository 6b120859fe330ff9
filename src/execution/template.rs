//! Command Templating
//!
//! Renders a node's command template into the text handed to bash.
//!
//! Supported placeholders:
//! - `{input}` / `{output}`: every path of every role, space-separated
//! - `{input.<role>}` / `{output.<role>}`: the paths of one role
//! - `{params.<name>}`: a resolved parameter
//! - `{wildcards.<name>}`: the node's wildcard value
//! - `{threads}`: the node's thread allocation
//! - `{log}`: the node's log file
//!
//! `{{` and `}}` produce literal braces. Any other brace group (awk programs,
//! `${VAR}` expansions) passes through as written.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{EngineError, Result};
use crate::workflow::graph::{Graph, GraphNode, NodeRole};

/// A command ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedCommand {
    /// Shell text with every placeholder substituted
    pub script: String,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    pub threads: usize,
    /// Rendered progress message, if the step declares one
    pub message: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Placeholder<'a> {
    AllInputs,
    AllOutputs,
    Input(&'a str),
    Output(&'a str),
    Param(&'a str),
    Wildcard(&'a str),
    Threads,
    Log,
}

impl<'a> Placeholder<'a> {
    /// Recognizes placeholder-shaped text between braces.
    fn parse(inner: &'a str) -> Option<Self> {
        match inner {
            "input" => return Some(Self::AllInputs),
            "output" => return Some(Self::AllOutputs),
            "threads" => return Some(Self::Threads),
            "log" => return Some(Self::Log),
            _ => {}
        }

        let (namespace, name) = inner.split_once('.')?;
        if !is_identifier(name) {
            return None;
        }
        match namespace {
            "input" => Some(Self::Input(name)),
            "output" => Some(Self::Output(name)),
            "params" => Some(Self::Param(name)),
            "wildcards" => Some(Self::Wildcard(name)),
            _ => None,
        }
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Renders the command of a single node.
pub fn render(node: &GraphNode) -> Result<RenderedCommand> {
    let script = render_text(node, &node.instance.command)?;
    let message = node
        .instance
        .message
        .as_deref()
        .map(|m| render_text(node, m))
        .transpose()?;

    debug!("Rendered '{}': {}", node.id(), script);

    Ok(RenderedCommand {
        script,
        working_dir: node.working_dir.clone(),
        log_path: node.log_path.clone(),
        threads: node.threads,
        message,
    })
}

/// Renders every node, failing on the first bad template. Indexed like the graph.
pub fn render_all(graph: &Graph) -> Result<Vec<RenderedCommand>> {
    graph.nodes().iter().map(render).collect()
}

fn render_text(node: &GraphNode, template: &str) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }

        // Closing brace of the innermost group, if there is one
        let body = &tail[1..];
        if let Some(end) = body.find(['{', '}']) {
            if body[end..].starts_with('}') {
                if let Some(placeholder) = Placeholder::parse(&body[..end]) {
                    out.push_str(&substitute(node, placeholder)?);
                    rest = &body[end + 1..];
                    continue;
                }
            }
        }

        out.push('{');
        rest = body;
    }

    out.push_str(rest);
    Ok(out)
}

fn substitute(node: &GraphNode, placeholder: Placeholder<'_>) -> Result<String> {
    let template_error = |reason: String| EngineError::Template {
        step: node.id().to_string(),
        reason,
    };

    let value = match placeholder {
        Placeholder::AllInputs => join_paths(node.input_paths()),
        Placeholder::AllOutputs => join_paths(node.output_paths()),
        Placeholder::Input(role) => join_paths(
            find_role(&node.inputs, role)
                .ok_or_else(|| template_error(format!("undeclared input role '{}'", role)))?
                .paths
                .iter(),
        ),
        Placeholder::Output(role) => join_paths(
            find_role(&node.outputs, role)
                .ok_or_else(|| template_error(format!("undeclared output role '{}'", role)))?
                .paths
                .iter(),
        ),
        Placeholder::Param(name) => node
            .instance
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| template_error(format!("undeclared parameter '{}'", name)))?,
        Placeholder::Wildcard(name) => node
            .instance
            .wildcards
            .get(name)
            .cloned()
            .ok_or_else(|| template_error(format!("wildcard '{}' is not bound here", name)))?,
        Placeholder::Threads => node.threads.to_string(),
        Placeholder::Log => shell_word(&node.log_path),
    };

    Ok(value)
}

fn find_role<'n>(roles: &'n [NodeRole], name: &str) -> Option<&'n NodeRole> {
    roles.iter().find(|r| r.name == name)
}

fn join_paths<'p>(paths: impl Iterator<Item = &'p PathBuf>) -> String {
    paths.map(|p| shell_word(p)).collect::<Vec<_>>().join(" ")
}

/// Quotes a path for bash when it contains anything beyond plain path characters.
fn shell_word(path: &Path) -> String {
    let text = path.to_string_lossy();
    let plain = text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ',' | ':' | '='));

    if plain && !text.is_empty() {
        text.into_owned()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}
