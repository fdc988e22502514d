//! The parallel, dependency-ordered scheduler.
//!
//! The scheduler builds the reachable sub-graph from the requested rules,
//! then drives a pool of worker threads off a bounded job channel. A rule
//! is dispatched only once every one of its dependencies has completed;
//! completion removes the rule's node from the graph, which is what frees
//! its predecessors. A failure is propagated transitively: every rule that
//! (directly or not) requires the failed one is finalized with a synthetic
//! "failed due to dependency" error without ever being dispatched.
//!
//! The main loop is the only writer of the graph and state table. Workers
//! only run rules and report back.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use color_eyre::{Report, Result, eyre::Context, eyre::eyre};
use tracing::{debug, instrument};

use crate::{
    graph::Graph,
    rule::Rule,
    runner::{Code, Outcome, RunOpts, Runner},
};

/// How long the main loop sleeps when there is neither a result to drain
/// nor a rule ready to dispatch.
const IDLE_WAIT: Duration = Duration::from_millis(20);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Unscheduled,
    Scheduled,
    Completed,
    Failed,
}

struct Completion {
    node_id: String,
    outcome: Outcome,
}

/// The aggregated result of one scheduler run.
#[derive(Debug, Default)]
pub struct Summary {
    /// Final code per rule, keyed by node id. Rules that never ran are
    /// absent.
    pub codes: BTreeMap<String, Code>,
    /// Every per-rule error, including propagated ones.
    pub errors: Vec<Report>,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Scheduler {
    runner: Arc<dyn Runner>,
    workers: usize,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn Runner>, workers: usize) -> Self {
        Self {
            runner,
            workers: workers.max(1),
        }
    }

    /// Run the targets and everything they transitively require.
    #[instrument(name = "Scheduler::run", skip_all, fields(targets = targets.len()))]
    pub fn run(&self, targets: &[Arc<Rule>], opts: &RunOpts) -> Result<Summary> {
        let (rules, mut graph) = build_graph(targets)?;
        graph
            .topological_sort()
            .context("dependency graph is not schedulable")?;

        let total = rules.len();
        let mut states: BTreeMap<String, State> = rules
            .keys()
            .map(|id| (id.clone(), State::Unscheduled))
            .collect();
        let mut summary = Summary::default();

        let (job_tx, job_rx) = flume::bounded::<Arc<Rule>>(self.workers);
        let (result_tx, result_rx) = flume::bounded::<Completion>(total.max(1));

        std::thread::scope(|scope| {
            for _ in 0..self.workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let runner = self.runner.clone();
                let opts = opts.clone();
                scope.spawn(move || {
                    for rule in job_rx.iter() {
                        let outcome = runner.run(&rule, opts.clone());
                        let _ = result_tx.send(Completion {
                            node_id: rule.node_id(),
                            outcome,
                        });
                    }
                });
            }
            drop(result_tx);
            drop(job_rx);

            let mut done = 0usize;
            while done < total {
                if opts.cancel.is_cancelled() {
                    debug!("scheduler cancelled");
                    break;
                }

                let mut progressed = false;
                while let Ok(completion) = result_rx.try_recv() {
                    progressed = true;
                    done += finalize(completion, &mut graph, &mut states, &mut summary);
                }

                // The state table is ordered by node id, so dispatch order
                // over the ready frontier is deterministic.
                let ready: Vec<String> = states
                    .iter()
                    .filter(|(id, state)| {
                        **state == State::Unscheduled && graph.from(id).is_empty()
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                let mut full = false;
                for id in ready {
                    match job_tx.try_send(rules[&id].clone()) {
                        Ok(()) => {
                            debug!(node = %id, "dispatched");
                            states.insert(id, State::Scheduled);
                            progressed = true;
                        }
                        Err(_) => {
                            full = true;
                            break;
                        }
                    }
                }

                if !progressed || full {
                    if let Ok(completion) = result_rx.recv_timeout(IDLE_WAIT) {
                        done += finalize(completion, &mut graph, &mut states, &mut summary);
                    }
                }
            }
            drop(job_tx);
        });

        for target in targets {
            let id = target.node_id();
            if !matches!(
                states.get(&id),
                Some(State::Completed) | Some(State::Failed),
            ) {
                summary.errors.push(eyre!("Rule did not run: {id}"));
            }
        }
        Ok(summary)
    }
}

/// DFS from the targets over dependencies; edges point from a rule to each
/// of its dependencies.
fn build_graph(targets: &[Arc<Rule>]) -> Result<(BTreeMap<String, Arc<Rule>>, Graph)> {
    let mut rules = BTreeMap::new();
    let mut graph = Graph::new();
    let mut stack: Vec<Arc<Rule>> = targets.to_vec();
    while let Some(rule) = stack.pop() {
        let id = rule.node_id();
        if rules.contains_key(&id) {
            continue;
        }
        graph.add(id.clone());
        rules.insert(id.clone(), rule.clone());
        for dep in rule.dependencies()? {
            graph.connect(id.clone(), dep.node_id());
            stack.push(dep);
        }
    }
    Ok((rules, graph))
}

/// Record a completion, remove the node, and on failure poison every
/// transitive predecessor. Returns how many rules were finalized.
fn finalize(
    completion: Completion,
    graph: &mut Graph,
    states: &mut BTreeMap<String, State>,
    summary: &mut Summary,
) -> usize {
    let Completion { node_id, outcome } = completion;
    let mut finalized = 1;
    summary.codes.insert(node_id.clone(), outcome.code);

    if !outcome.is_failure() {
        debug!(node = %node_id, code = %outcome.code, "completed");
        states.insert(node_id.clone(), State::Completed);
        graph.remove(&node_id);
        return finalized;
    }

    debug!(node = %node_id, code = %outcome.code, "failed");
    states.insert(node_id.clone(), State::Failed);
    if let Some(error) = outcome.error {
        summary.errors.push(error);
    } else {
        summary.errors.push(eyre!("rule {node_id} failed"));
    }

    // Poison predecessors breadth-first, each error naming the direct
    // dependency that took it down.
    let mut stack: Vec<(String, String)> = graph
        .to(&node_id)
        .into_iter()
        .map(|pred| (pred, node_id.clone()))
        .collect();
    graph.remove(&node_id);
    while let Some((pred, dep)) = stack.pop() {
        if states.get(&pred) == Some(&State::Failed) {
            continue;
        }
        states.insert(pred.clone(), State::Failed);
        summary.codes.insert(pred.clone(), Code::ExecError);
        summary
            .errors
            .push(eyre!("rule {pred} failed due to dependency {dep}"));
        finalized += 1;
        stack.extend(
            graph
                .to(&pred)
                .into_iter()
                .map(|next| (next, pred.clone())),
        );
        graph.remove(&pred);
    }
    finalized
}
