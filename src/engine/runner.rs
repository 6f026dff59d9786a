use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::mpsc::channel;
use std::time::Instant;

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::Environment;
use crate::engine::{TaskContext, TaskGraph};
use crate::error::ShippyError;

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template("{spinner:.green} [{elapsed}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

/// One invocation of an entry point. Tracks which tasks already completed so
/// that a prerequisite shared by several steps runs only once.
pub(crate) struct Session<'a> {
    graph: &'a TaskGraph,
    env: &'a Environment,
    tolerant: bool,
    completed: Mutex<HashSet<NodeIndex>>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(graph: &'a TaskGraph, env: &'a Environment, tolerant: bool) -> Self {
        Self {
            graph,
            env,
            tolerant,
            completed: Mutex::new(HashSet::new()),
        }
    }

    /// Run `targets` together with every prerequisite that has not completed
    /// in this session yet.
    ///
    /// Tasks are started on their own threads as soon as their dependency
    /// count drops to zero:
    /// 1. Count, for every node to run, how many of its prerequisites are
    ///    also scheduled.
    /// 2. Start every node with a zero count.
    /// 3. Wait for results on a channel. A success decrements the counts of
    ///    the dependents and starts those reaching zero.
    /// 4. After the first failure nothing new is started; tasks already in
    ///    flight are waited for and the first error is returned.
    pub(crate) fn run(&self, targets: &[NodeIndex]) -> Result<(), ShippyError> {
        let graph = &self.graph.graph;

        let mut nodes = self.graph.closure(targets);
        {
            let completed = self.completed.lock().unwrap();
            nodes.retain(|index| targets.contains(index) || !completed.contains(index));
        }

        let mut counts: HashMap<NodeIndex, usize> = nodes
            .iter()
            .map(|&index| {
                (
                    index,
                    graph
                        .neighbors_directed(index, Direction::Incoming)
                        .filter(|dep| nodes.contains(dep))
                        .count(),
                )
            })
            .collect();

        let mut failure = None;

        std::thread::scope(|s| {
            let (tx, rx) = channel::<(NodeIndex, Result<(), ShippyError>)>();
            let mut in_flight = 0usize;

            let spawn = |index: NodeIndex| {
                let tx = tx.clone();
                s.spawn(move || {
                    let result = self.execute(index);
                    // the receiver outlives every spawned task
                    let _ = tx.send((index, result));
                });
            };

            for (&index, &count) in &counts {
                if count == 0 {
                    spawn(index);
                    in_flight += 1;
                }
            }

            while in_flight > 0 {
                let Ok((index, result)) = rx.recv() else {
                    break;
                };
                in_flight -= 1;

                match result {
                    Ok(()) if failure.is_none() => {
                        for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
                            if let Some(count) = counts.get_mut(&dependent) {
                                *count -= 1;
                                if *count == 0 {
                                    spawn(dependent);
                                    in_flight += 1;
                                }
                            }
                        }
                    }
                    Ok(()) => {}
                    Err(err) => {
                        tracing::error!("{err}");
                        failure.get_or_insert(err);
                    }
                }
            }
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn execute(&self, index: NodeIndex) -> Result<(), ShippyError> {
        let task = &self.graph.graph[index];

        let span = tracing::span!(Level::INFO, "task", name = task.name.as_str());
        if !task.long_running {
            span.pb_set_style(&TASK_STYLE);
            span.pb_set_message(&format!("Running {}", task.name));
        }
        let _enter = span.enter();

        let context = TaskContext {
            name: &task.name,
            env: self.env,
            graph: self.graph,
            tolerant: self.tolerant,
            span: span.clone(),
        };

        let s = Instant::now();
        tracing::info!("starting '{}'", task.name);

        match catch_unwind(AssertUnwindSafe(|| (task.body)(&context))) {
            Ok(Ok(())) => {
                tracing::info!("finished '{}' {}", task.name, crate::io::as_overhead(s));
                self.completed.lock().unwrap().insert(index);
                Ok(())
            }
            Ok(Err(err)) => Err(ShippyError::Task(task.name.clone(), err)),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };

                Err(ShippyError::Panic(task.name.clone(), msg))
            }
        }
    }
}
