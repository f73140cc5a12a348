//! Vendor operator capability and prompt matching.
//!
//! An [`Operator`] tells the engine everything vendor specific about a
//! device family: which prompts end a response in each CLI mode, which
//! lines signal a rejected command, how lines are terminated and which
//! commands move the CLI from one mode to another. [`DeviceOperator`] is a
//! table-driven implementation; callers with unusual devices implement the
//! trait directly.

use std::collections::{HashMap, HashSet, VecDeque};

use async_ssh2_tokio::client::Client;
use async_trait::async_trait;
use log::trace;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ConnectError;
use crate::session::SshShell;

/// Per-device-family CLI knowledge consumed by a session.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Ordered prompt patterns that terminate a response in `mode`.
    fn prompts(&self, mode: &str) -> &[Regex];

    /// Ordered patterns of device-reported command errors.
    fn error_patterns(&self) -> &[Regex];

    /// Terminator appended to every written command.
    fn line_break(&self) -> &str;

    /// Steps that move the CLI from `from` to `to`, in order.
    ///
    /// Each step names the mode whose prompts confirm it, so a path through
    /// intermediate modes is checked hop by hop.
    fn transitions(&self, from: &str, to: &str) -> Vec<TransitionStep>;

    /// Prepares the interactive shell on a freshly authenticated SSH client.
    ///
    /// The default requests an `xterm` pseudo-terminal and a shell on a new
    /// channel, which is what most network operating systems expect.
    async fn init_ssh(&self, client: &Client) -> Result<SshShell, ConnectError> {
        let channel = client.get_channel().await?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        Ok(SshShell::from_channel(channel))
    }
}

/// A successful match of one pattern out of an ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Index of the pattern that matched.
    pub index: usize,
    /// Full match text.
    pub text: String,
    /// Capture groups in order; groups that did not participate are `None`.
    pub groups: Vec<Option<String>>,
}

/// Leading NULs and a carriage return that terminals emit before redraws.
static PROMPT_NOISE: Lazy<Regex> = Lazy::new(|| match Regex::new(r"^\x00*\r?") {
    Ok(re) => re,
    Err(err) => panic!("invalid PROMPT_NOISE regex: {err}"),
});

/// Returns the first pattern that matches `line`, in list order.
pub fn any_pattern_matches(line: &str, patterns: &[Regex]) -> Option<PatternMatch> {
    patterns.iter().enumerate().find_map(|(index, re)| {
        let caps = re.captures(line)?;
        trace!("{} matched {:?}", re.as_str(), line);
        let text = caps.get(0).map(|m| m.as_str().to_string())?;
        let groups = caps
            .iter()
            .skip(1)
            .map(|g| g.map(|m| m.as_str().to_string()))
            .collect();
        Some(PatternMatch {
            index,
            text,
            groups,
        })
    })
}

/// Last line of `text`, with the line terminator removed.
///
/// A trailing newline does not start a new (empty) line, so the last line of
/// `"abc\r\n"` is `"abc"`.
pub fn last_line(text: &str) -> &str {
    let body = text.strip_suffix('\n').unwrap_or(text);
    let line = match body.rfind('\n') {
        Some(pos) => &body[pos + 1..],
        None => body,
    };
    line.strip_suffix('\r').unwrap_or(line)
}

/// Strips terminal noise from the start of a candidate prompt line.
pub fn normalize_prompt_line(line: &str) -> &str {
    match PROMPT_NOISE.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

/// A directed edge of the mode graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEdge {
    pub from: String,
    pub to: String,
    /// Commands sent in order to follow this edge.
    pub commands: Vec<String>,
}

/// One command of a mode transition and the mode it leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionStep {
    pub command: String,
    /// Mode whose prompts end this step's response.
    pub expect_mode: String,
}

/// Table-driven [`Operator`].
///
/// Mode names are case-insensitive. Transitions are derived from the edge
/// table by a shortest-path search, so only adjacent modes need edges.
#[derive(Debug, Clone)]
pub struct DeviceOperator {
    /// Prompt patterns keyed by lower-cased mode.
    prompts: HashMap<String, Vec<Regex>>,
    errors: Vec<Regex>,
    line_break: String,
    edges: Vec<TransitionEdge>,
}

fn compile_all<I, S>(what: &str, patterns: I) -> Result<Vec<Regex>, ConnectError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|p| {
            Regex::new(p.as_ref()).map_err(|err| {
                ConnectError::InvalidOperatorConfig(format!(
                    "invalid {} regex '{}': {}",
                    what,
                    p.as_ref(),
                    err
                ))
            })
        })
        .collect()
}

impl DeviceOperator {
    /// Creates an operator from prompt, error and transition tables.
    ///
    /// # Arguments
    ///
    /// * `prompts` - List of (mode, prompt patterns)
    /// * `errors` - Patterns of device-reported errors
    /// * `edges` - Transitions as (from, commands, to)
    ///
    /// The line break defaults to `"\n"`; see [`DeviceOperator::with_line_break`].
    pub fn new<I, S>(
        prompts: Vec<(String, I)>,
        errors: I,
        edges: Vec<(String, Vec<String>, String)>,
    ) -> Result<DeviceOperator, ConnectError>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = S>,
    {
        let mut table: HashMap<String, Vec<Regex>> = HashMap::new();
        for (mode, patterns) in prompts {
            let compiled = compile_all(&format!("prompt for mode '{mode}'"), patterns)?;
            table
                .entry(mode.to_ascii_lowercase())
                .or_default()
                .extend(compiled);
        }

        let errors = compile_all("error", errors)?;

        let edges = edges
            .into_iter()
            .map(|(from, commands, to)| TransitionEdge {
                from: from.to_ascii_lowercase(),
                to: to.to_ascii_lowercase(),
                commands,
            })
            .collect();

        Ok(Self {
            prompts: table,
            errors,
            line_break: "\n".to_string(),
            edges,
        })
    }

    /// Replaces the line terminator appended to every command.
    pub fn with_line_break(mut self, line_break: impl Into<String>) -> Self {
        self.line_break = line_break.into();
        self
    }

    /// Modes with at least one prompt pattern, sorted.
    pub fn modes(&self) -> Vec<String> {
        let mut modes: Vec<String> = self.prompts.keys().cloned().collect();
        modes.sort();
        modes
    }

    pub fn edges(&self) -> &[TransitionEdge] {
        &self.edges
    }

    /// Steps along the shortest edge path from `from` to `to`.
    ///
    /// Breadth-first search over the edge table; equal modes give an empty
    /// path.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError::UnreachableState` if no path exists.
    pub fn transition_path(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Vec<TransitionStep>, ConnectError> {
        let start = from.to_ascii_lowercase();
        let end = to.to_ascii_lowercase();
        if start == end {
            return Ok(Vec::new());
        }

        let mut adj: HashMap<&str, Vec<&TransitionEdge>> = HashMap::new();
        for edge in &self.edges {
            adj.entry(edge.from.as_str()).or_default().push(edge);
        }

        let mut queue = VecDeque::new();
        queue.push_back(start.as_str());
        let mut visited = HashSet::new();
        visited.insert(start.as_str());
        // child -> edge that discovered it
        let mut predecessors: HashMap<&str, &TransitionEdge> = HashMap::new();

        while let Some(node) = queue.pop_front() {
            if node == end {
                break;
            }
            for edge in adj.get(node).into_iter().flatten() {
                if visited.insert(edge.to.as_str()) {
                    predecessors.insert(edge.to.as_str(), *edge);
                    queue.push_back(edge.to.as_str());
                }
            }
        }

        if !predecessors.contains_key(end.as_str()) {
            return Err(ConnectError::UnreachableState(to.to_string()));
        }

        let mut hops = Vec::new();
        let mut current = end.as_str();
        while current != start {
            let Some(edge) = predecessors.get(current) else {
                return Err(ConnectError::UnreachableState(to.to_string()));
            };
            hops.push(*edge);
            current = edge.from.as_str();
        }
        hops.reverse();

        let path: Vec<TransitionStep> = hops
            .into_iter()
            .flat_map(|edge| {
                edge.commands.iter().map(move |command| TransitionStep {
                    command: command.clone(),
                    expect_mode: edge.to.clone(),
                })
            })
            .collect();
        trace!("Command path {} -> {}: {:?}", from, to, path);
        Ok(path)
    }
}

#[async_trait]
impl Operator for DeviceOperator {
    fn prompts(&self, mode: &str) -> &[Regex] {
        self.prompts
            .get(&mode.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn error_patterns(&self) -> &[Regex] {
        &self.errors
    }

    fn line_break(&self) -> &str {
        &self.line_break
    }

    fn transitions(&self, from: &str, to: &str) -> Vec<TransitionStep> {
        self.transition_path(from, to).unwrap_or_default()
    }
}
