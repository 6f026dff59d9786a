//! The task registry and the sequencer.
//!
//! Tasks are registered by name on a [`Registry`] together with the names of
//! their prerequisites. [`Registry::validate`] turns the registry into a
//! [`TaskGraph`]: a directed acyclic graph checked for unknown names and
//! cycles before anything runs. Entry points are either single tasks or
//! named [`Sequence`]s of steps.

mod runner;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, Reversed};
use tracing::Span;

use crate::core::{Environment, Mode};
use crate::error::{GraphError, ShippyError};

pub(crate) use runner::Session;

/// Body of a task. Returning is the completion signal, an `Err` marks the
/// task as failed.
pub type TaskFn = Arc<dyn Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Everything a running task can see.
pub struct TaskContext<'a> {
    /// Name of the running task.
    pub name: &'a str,
    pub env: &'a Environment,
    /// The graph the task belongs to, for tasks that drive other tasks.
    pub graph: &'a TaskGraph,
    /// Set while a watch session starts up. Tasks should log failures of
    /// single files and complete anyway, so a broken file doesn't keep the
    /// server from starting.
    pub tolerant: bool,
    pub span: Span,
}

pub(crate) struct Task {
    pub name: String,
    pub prerequisites: Vec<String>,
    pub long_running: bool,
    pub body: TaskFn,
}

/// One step of a [`Sequence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Run a task and wait for it.
    Task(String),
    /// Start every task together and wait for all of them.
    Group(Vec<String>),
}

impl Step {
    fn names(&self) -> &[String] {
        match self {
            Step::Task(name) => std::slice::from_ref(name),
            Step::Group(names) => names,
        }
    }
}

/// An ordered list of steps run as one entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    steps: Vec<Step>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, name: impl Into<String>) -> Self {
        self.steps.push(Step::Task(name.into()));
        self
    }

    pub fn group<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps
            .push(Step::Group(names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// Collects task and sequence definitions.
#[derive(Default)]
pub struct Registry {
    tasks: Vec<Task>,
    sequences: Vec<(String, Sequence)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under `name`, to run after every task in
    /// `prerequisites` has completed.
    pub fn register<I, S, F>(&mut self, name: impl Into<String>, prerequisites: I, body: F)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.task(name).after(prerequisites).run(body);
    }

    /// Starts defining a task.
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_> {
        TaskDef {
            registry: self,
            name: name.into(),
            prerequisites: Vec::new(),
            long_running: false,
        }
    }

    pub fn sequence(&mut self, name: impl Into<String>, sequence: Sequence) {
        self.sequences.push((name.into(), sequence));
    }

    /// Build the dependency graph and check it for unknown names and cycles.
    pub fn validate(self) -> Result<TaskGraph, GraphError> {
        let mut graph = Graph::new();
        let mut index = HashMap::new();

        for task in self.tasks {
            let name = task.name.clone();
            if index.contains_key(&name) {
                return Err(GraphError::Duplicate(name));
            }
            index.insert(name, graph.add_node(task));
        }

        let mut edges = Vec::new();
        for target in graph.node_indices() {
            let task: &Task = &graph[target];
            for prerequisite in &task.prerequisites {
                let Some(&source) = index.get(prerequisite) else {
                    return Err(GraphError::UnknownPrerequisite {
                        task: task.name.clone(),
                        prerequisite: prerequisite.clone(),
                    });
                };
                edges.push((source, target));
            }
        }

        for (source, target) in edges {
            graph.add_edge(source, target, ());
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            return Err(GraphError::Cycle(graph[cycle.node_id()].name.clone()));
        }

        let mut sequences = BTreeMap::new();
        for (name, sequence) in self.sequences {
            if index.contains_key(&name) || sequences.contains_key(&name) {
                return Err(GraphError::Duplicate(name));
            }
            for task in sequence.steps.iter().flat_map(Step::names) {
                if !index.contains_key(task) {
                    return Err(GraphError::UnknownStep {
                        sequence: name,
                        task: task.clone(),
                    });
                }
            }
            sequences.insert(name, sequence);
        }

        Ok(TaskGraph {
            graph,
            index,
            sequences,
        })
    }
}

pub struct TaskDef<'a> {
    registry: &'a mut Registry,
    name: String,
    prerequisites: Vec<String>,
    long_running: bool,
}

impl TaskDef<'_> {
    pub fn after<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites
            .extend(prerequisites.into_iter().map(Into::into));
        self
    }

    /// Marks a task that never finishes on its own, such as a watch loop.
    /// Entry points that reach such a task run in [`Mode::Watch`].
    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }

    pub fn run<F>(self, body: F)
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.tasks.push(Task {
            name: self.name,
            prerequisites: self.prerequisites,
            long_running: self.long_running,
            body: Arc::new(body),
        });
    }
}

/// A validated set of tasks and sequences.
pub struct TaskGraph {
    pub(crate) graph: Graph<Task, ()>,
    index: HashMap<String, NodeIndex>,
    sequences: BTreeMap<String, Sequence>,
}

impl TaskGraph {
    /// Task names in registration order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|task| task.name.as_str())
    }

    pub fn sequences(&self) -> impl Iterator<Item = (&str, &Sequence)> {
        self.sequences.iter().map(|(name, seq)| (name.as_str(), seq))
    }

    pub fn prerequisites(&self, name: &str) -> Result<&[String], GraphError> {
        let index = self.lookup(name)?;
        Ok(&self.graph[index].prerequisites)
    }

    pub(crate) fn lookup(&self, name: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::Unknown(name.to_string()))
    }

    /// Every task that has to run for `targets`, prerequisites included.
    pub(crate) fn closure(&self, targets: &[NodeIndex]) -> HashSet<NodeIndex> {
        let reversed = Reversed(&self.graph);
        let mut nodes = HashSet::new();

        for &target in targets {
            let mut dfs = Dfs::new(reversed, target);
            while let Some(index) = dfs.next(reversed) {
                nodes.insert(index);
            }
        }

        nodes
    }

    /// The mode an entry point needs: [`Mode::Watch`] if it reaches a
    /// long-running task.
    pub fn mode_for(&self, entry: &str) -> Result<Mode, GraphError> {
        let targets = match self.sequences.get(entry) {
            Some(sequence) => sequence
                .steps
                .iter()
                .flat_map(Step::names)
                .map(|name| self.lookup(name))
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![self.lookup(entry)?],
        };

        let watching = self
            .closure(&targets)
            .into_iter()
            .any(|index| self.graph[index].long_running);

        Ok(if watching { Mode::Watch } else { Mode::Build })
    }

    /// Run a single task after its prerequisites.
    pub fn run(&self, name: &str, env: &Environment) -> Result<(), ShippyError> {
        Session::new(self, env, false).run(&[self.lookup(name)?])
    }

    /// Run every step of `sequence` in order, stopping at the first failure.
    pub fn run_sequence(&self, sequence: &Sequence, env: &Environment) -> Result<(), ShippyError> {
        self.run_steps(sequence, &Session::new(self, env, false))
    }

    fn run_steps(&self, sequence: &Sequence, session: &Session<'_>) -> Result<(), ShippyError> {
        for step in &sequence.steps {
            let targets = step
                .names()
                .iter()
                .map(|name| self.lookup(name))
                .collect::<Result<Vec<_>, _>>()?;

            session.run(&targets)?;
        }

        Ok(())
    }

    /// Run a named sequence, or a task when no sequence has that name.
    ///
    /// In [`Mode::Watch`] the tasks run with [`TaskContext::tolerant`] set.
    pub fn run_entry(&self, entry: &str, env: &Environment) -> Result<(), ShippyError> {
        let session = Session::new(self, env, env.mode == Mode::Watch);

        match self.sequences.get(entry) {
            Some(sequence) => self.run_steps(sequence, &session),
            None => session.run(&[self.lookup(entry)?]),
        }
    }
}

impl Display for TaskGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            if let Some((source, target)) = self.graph.edge_endpoints(edge) {
                writeln!(f, "    {:?} --> {:?}", source.index(), target.index())?;
            }
        }

        for (name, sequence) in &self.sequences {
            writeln!(f, "    subgraph {name}")?;
            let mut previous: Vec<usize> = Vec::new();
            for step in &sequence.steps {
                let current: Vec<usize> = step
                    .names()
                    .iter()
                    .filter_map(|name| self.index.get(name))
                    .map(|index| index.index())
                    .collect();
                for a in &previous {
                    for b in &current {
                        writeln!(f, "        {a} -.-> {b}")?;
                    }
                }
                previous = current;
            }
            writeln!(f, "    end")?;
        }

        Ok(())
    }
}
