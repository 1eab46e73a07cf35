//! Declarative description of a build for an external incremental executor.
//!
//! A [`BuildGraph`] is a set of rules and build statements in the shape ninja
//! understands. Each statement names the files it consumes and produces using
//! four kinds of edges:
//!
//! * explicit inputs and outputs, which drive staleness and appear as `$in`
//!   and `$out` in the rule command;
//! * implicit inputs, which drive staleness but are not passed to the command;
//! * implicit outputs, which downstream statements may depend on, but whose
//!   absence never marks their own statement stale;
//! * order-only inputs, which must exist before the statement runs but whose
//!   timestamps are ignored.
//!
//! A rule marked `restat` may leave its outputs untouched when they already
//! hold what it would write. Statements downstream of such a run stay clean.
//!
//! Internally statements are nodes of a petgraph [`Graph`]. An edge connects
//! the statement producing a file to every statement consuming it, tagged
//! with the kind of input edge that consumes it.

use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter, Write as _};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Graph;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::core::BuildConfig;
use crate::error::GraphError;
use crate::fingerprint::SettingsFingerprint;
use crate::node::{ArtifactKind, BuildNode};
use crate::project::ProjectSpec;

/// Artifacts the manifest is assembled from.
const CONSUMED: [ArtifactKind; 4] = [
    ArtifactKind::Structure,
    ArtifactKind::ContactMap,
    ArtifactKind::InputSet,
    ArtifactKind::OutputSet,
];

/// The way a statement consumes a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Explicit,
    Implicit,
    OrderOnly,
}

impl EdgeKind {
    /// Whether the timestamp of the file can make the consumer stale.
    pub fn gates_staleness(self) -> bool {
        !matches!(self, EdgeKind::OrderOnly)
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub command: String,
    pub description: String,
    pub pool: Option<String>,
    pub restat: bool,
}

impl Rule {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            description: String::new(),
            pool: None,
            restat: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    /// The command only rewrites outputs whose content changes.
    pub fn restat(mut self) -> Self {
        self.restat = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildStatement {
    pub rule: String,
    pub outputs: Vec<Utf8PathBuf>,
    pub implicit_outputs: Vec<Utf8PathBuf>,
    pub inputs: Vec<Utf8PathBuf>,
    pub implicit_inputs: Vec<Utf8PathBuf>,
    pub order_only: Vec<Utf8PathBuf>,
    pub variables: Vec<(String, String)>,
    /// Bytes the command leaves in its explicit output, when known up front.
    pub content: Option<Vec<u8>>,
}

impl BuildStatement {
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            ..Default::default()
        }
    }

    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn implicit_outputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.implicit_outputs.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn implicit_inputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.implicit_inputs.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn order_only<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.order_only.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.variables.push((key.into(), value.to_string()));
        self
    }

    pub fn writes(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = Some(content.into());
        self
    }

    fn all_outputs(&self) -> impl Iterator<Item = &Utf8PathBuf> {
        self.outputs.iter().chain(&self.implicit_outputs)
    }

    fn all_inputs(&self) -> impl Iterator<Item = (EdgeKind, &Utf8PathBuf)> {
        let explicit = self.inputs.iter().map(|p| (EdgeKind::Explicit, p));
        let implicit = self.implicit_inputs.iter().map(|p| (EdgeKind::Implicit, p));
        let order_only = self.order_only.iter().map(|p| (EdgeKind::OrderOnly, p));
        explicit.chain(implicit).chain(order_only)
    }

    /// Human readable name, the first explicit output.
    pub fn name(&self) -> &str {
        self.outputs.first().map(|p| p.as_str()).unwrap_or(&self.rule)
    }
}

/// Collects rules and statements before they are linked into a graph.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    pools: Vec<(String, usize)>,
    rules: Vec<Rule>,
    statements: Vec<BuildStatement>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a pool limiting how many statements of its rules run at once.
    pub fn pool(&mut self, name: impl Into<String>, depth: usize) -> &mut Self {
        self.pools.push((name.into(), depth.max(1)));
        self
    }

    pub fn rule(&mut self, rule: Rule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn build(&mut self, statement: BuildStatement) -> &mut Self {
        self.statements.push(statement);
        self
    }

    /// Link statements by the files they share and reject malformed graphs.
    pub fn finish(self) -> Result<BuildGraph, GraphError> {
        let GraphBuilder {
            pools,
            rules,
            statements,
        } = self;

        let mut graph = Graph::<usize, EdgeKind>::new();
        let mut producers: HashMap<&Utf8Path, NodeIndex> = HashMap::new();

        for (i, statement) in statements.iter().enumerate() {
            if !rules.iter().any(|rule| rule.name == statement.rule) {
                return Err(GraphError::UnknownRule(statement.rule.clone()));
            }

            let index = graph.add_node(i);

            for output in statement.all_outputs() {
                if producers.insert(output.as_path(), index).is_some() {
                    return Err(GraphError::DuplicateOutput(output.clone()));
                }
            }
        }

        for (i, statement) in statements.iter().enumerate() {
            let consumer = NodeIndex::new(i);

            for (kind, input) in statement.all_inputs() {
                if let Some(&producer) = producers.get(input.as_path()) {
                    graph.add_edge(producer, consumer, kind);
                }
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(statements[graph[cycle.node_id()]].name().into()))?;

        let producers = producers
            .into_iter()
            .map(|(path, index)| (path.to_owned(), index))
            .collect();

        Ok(BuildGraph {
            pools,
            rules,
            statements,
            graph,
            order,
            producers,
        })
    }
}

/// How the rules of a project graph call back into this program.
#[derive(Debug, Clone, Copy)]
pub struct Callbacks<'a> {
    /// Command line of this program, including any global options.
    pub invocation: &'a str,
    /// Whether a catalog populator is configured. Without one the manifest is
    /// the final target.
    pub populate: bool,
    /// Must exist before the catalog is populated.
    pub version_marker: Option<&'a Utf8Path>,
}

impl<'a> Callbacks<'a> {
    pub fn new(invocation: &'a str) -> Self {
        Self {
            invocation,
            populate: false,
            version_marker: None,
        }
    }

    pub fn with_populate(mut self, version_marker: Option<&'a Utf8Path>) -> Self {
        self.populate = true;
        self.version_marker = version_marker;
        self
    }
}

/// A validated, acyclic build description.
#[derive(Debug)]
pub struct BuildGraph {
    pools: Vec<(String, usize)>,
    rules: Vec<Rule>,
    statements: Vec<BuildStatement>,
    graph: Graph<usize, EdgeKind>,
    order: Vec<NodeIndex>,
    producers: HashMap<Utf8PathBuf, NodeIndex>,
}

impl BuildGraph {
    /// Describe the whole pipeline of a project.
    ///
    /// Every rule command calls back into the program through `callbacks`.
    /// The settings stamp is rebuilt from the project file by a `restat`
    /// rule and is an implicit input of every compute statement, so a
    /// settings change reaches the executor as an ordinary timestamp change
    /// while edits to display settings do not. The version marker, when
    /// given, must exist before the catalog is populated but never triggers a
    /// repopulation on its own.
    pub fn for_project(
        config: &BuildConfig,
        project_file: &Utf8Path,
        spec: &ProjectSpec,
        callbacks: Callbacks<'_>,
    ) -> Result<Self, GraphError> {
        let invocation = callbacks.invocation;
        let project = shell_quote(config.project_dir.as_str());
        let stamp = SettingsFingerprint::from_settings(&spec.project).to_json()?;
        let mut builder = GraphBuilder::new();

        builder
            .pool("simulation", config.concurrency)
            .rule(
                Rule::new("stamp", format!("{invocation} stamp {project}"))
                    .description("STAMP $out")
                    .restat(),
            )
            .rule(
                Rule::new("compute", format!("{invocation} compute {project} $index"))
                    .description("SIMULATE $name")
                    .pool("simulation"),
            )
            .rule(
                Rule::new("assemble", format!("{invocation} assemble {project}"))
                    .description("ASSEMBLE $out"),
            );

        builder.build(
            BuildStatement::new("stamp")
                .output(config.stamp_path())
                .input(project_file)
                .writes(stamp),
        );

        let nodes: Vec<BuildNode> = spec
            .datasets
            .iter()
            .enumerate()
            .map(|(i, dataset)| BuildNode::for_dataset(config, i, dataset))
            .collect();

        for node in &nodes {
            builder.build(
                BuildStatement::new("compute")
                    .output(&node.output_dir)
                    .implicit_outputs(node.implicit_outputs())
                    .input(&node.input)
                    .implicit_inputs([config.stamp_path()])
                    .order_only(node.order_only.iter().cloned())
                    .variable("index", node.index)
                    .variable("name", &node.name),
            );
        }

        let consumed = nodes
            .iter()
            .flat_map(|node| CONSUMED.map(|kind| node.artifact(kind)));
        let tracks = spec
            .tracks
            .iter()
            .map(|track| config.resolve_input(&track.data));

        builder.build(
            BuildStatement::new("assemble")
                .output(config.manifest_path())
                .input(project_file)
                .implicit_inputs(consumed)
                .implicit_inputs(tracks),
        );

        if callbacks.populate {
            builder
                .rule(
                    Rule::new("populate", format!("{invocation} populate {project}"))
                        .description("POPULATE $in"),
                )
                .build(
                    BuildStatement::new("populate")
                        .output(config.populated_marker())
                        .input(config.manifest_path())
                        .order_only(callbacks.version_marker.map(Utf8Path::to_owned)),
                );
        }

        builder.finish()
    }

    pub fn statements(&self) -> &[BuildStatement] {
        &self.statements
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The statement producing `path`, if any.
    pub fn producer(&self, path: &Utf8Path) -> Option<&BuildStatement> {
        self.producers
            .get(path)
            .map(|&index| &self.statements[self.graph[index]])
    }

    /// Indices of the statements an executor would run now, judged by file
    /// timestamps alone.
    ///
    /// A statement is dirty when an explicit output is missing, when an
    /// explicit or implicit input is newer than its oldest explicit output or
    /// missing, or when a statement producing one of those inputs is dirty
    /// and its run would change them. Order-only inputs and implicit outputs
    /// never make a statement dirty. An input that is missing and produced by
    /// no statement is an error.
    pub fn dirty(&self) -> Result<BTreeSet<usize>, GraphError> {
        let mut dirty = BTreeSet::new();
        let mut changed = BTreeSet::new();

        for &index in &self.order {
            let i = self.graph[index];
            let statement = &self.statements[i];

            let upstream = self
                .graph
                .edges_directed(index, petgraph::Direction::Incoming)
                .filter(|edge| edge.weight().gates_staleness())
                .any(|edge| changed.contains(&self.graph[edge.source()]));

            if !upstream && !self.is_outdated(statement)? {
                continue;
            }

            dirty.insert(i);
            if !self.is_settled(statement) {
                changed.insert(i);
            }
        }

        Ok(dirty)
    }

    /// Whether a run of `statement` would leave its outputs as they are: its
    /// rule is `restat` and every explicit output already holds the known
    /// content.
    fn is_settled(&self, statement: &BuildStatement) -> bool {
        let restat = self
            .rules
            .iter()
            .any(|rule| rule.name == statement.rule && rule.restat);

        match &statement.content {
            Some(content) if restat => statement
                .outputs
                .iter()
                .all(|output| std::fs::read(output).is_ok_and(|bytes| bytes == *content)),
            _ => false,
        }
    }

    fn is_outdated(&self, statement: &BuildStatement) -> Result<bool, GraphError> {
        let mut oldest: Option<SystemTime> = None;

        for output in &statement.outputs {
            match mtime(output)? {
                Some(time) => oldest = Some(oldest.map_or(time, |o| o.min(time))),
                None => return Ok(true),
            }
        }

        let mut outdated = false;

        for (kind, input) in statement.all_inputs() {
            match mtime(input)? {
                None if !self.producers.contains_key(input) => {
                    return Err(GraphError::MissingInput(input.clone()));
                }
                None => outdated |= kind.gates_staleness(),
                Some(time) if kind.gates_staleness() => {
                    outdated |= oldest.is_some_and(|oldest| time > oldest);
                }
                Some(_) => {}
            }
        }

        Ok(outdated)
    }

    /// Render the graph in ninja syntax.
    pub fn to_ninja(&self) -> String {
        self.to_string()
    }
}

impl Display for BuildGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "# Generated by hicflow. Do not edit.")?;
        writeln!(f, "ninja_required_version = 1.7")?;
        writeln!(f)?;

        for (name, depth) in &self.pools {
            writeln!(f, "pool {name}")?;
            writeln!(f, "  depth = {depth}")?;
            writeln!(f)?;
        }

        for rule in &self.rules {
            writeln!(f, "rule {}", rule.name)?;
            writeln!(f, "  command = {}", rule.command)?;
            if !rule.description.is_empty() {
                writeln!(f, "  description = {}", rule.description)?;
            }
            if let Some(pool) = &rule.pool {
                writeln!(f, "  pool = {pool}")?;
            }
            if rule.restat {
                writeln!(f, "  restat = 1")?;
            }
            writeln!(f)?;
        }

        for statement in &self.statements {
            let mut line = String::from("build");
            push_paths(&mut line, "", &statement.outputs);
            push_paths(&mut line, " |", &statement.implicit_outputs);
            write!(line, ": {}", statement.rule)?;
            push_paths(&mut line, "", &statement.inputs);
            push_paths(&mut line, " |", &statement.implicit_inputs);
            push_paths(&mut line, " ||", &statement.order_only);

            writeln!(f, "{line}")?;
            for (key, value) in &statement.variables {
                writeln!(f, "  {key} = {}", value.replace('$', "$$"))?;
            }
            writeln!(f)?;
        }

        writeln!(f, "default {}", self.default_target())
    }
}

impl BuildGraph {
    fn default_target(&self) -> String {
        // Statements nothing else consumes.
        self.graph
            .node_indices()
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, petgraph::Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .filter_map(|i| self.statements[self.graph[i]].outputs.first())
            .map(|path| escape_path(path))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn push_paths(line: &mut String, separator: &str, paths: &[Utf8PathBuf]) {
    if paths.is_empty() {
        return;
    }

    line.push_str(separator);
    for path in paths {
        line.push(' ');
        line.push_str(&escape_path(path));
    }
}

/// Escape a path for use in a ninja build line.
fn escape_path(path: &Utf8Path) -> String {
    let mut out = String::with_capacity(path.as_str().len());

    for c in path.as_str().chars() {
        match c {
            '$' | ' ' | ':' => {
                out.push('$');
                out.push(c);
            }
            '\n' => out.push_str("$\n"),
            _ => out.push(c),
        }
    }

    out
}

/// Quote a word for the shell running a rule command, then escape it for
/// ninja.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));

    let quoted = if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    };

    quoted.replace('$', "$$")
}

fn mtime(path: &Utf8Path) -> Result<Option<SystemTime>, GraphError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
