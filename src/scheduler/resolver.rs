//! Dependency ordering for sequence jobs.
//!
//! Validation walks the graph depth-first with three colours; meeting a
//! node that is still in progress means a cycle, reported with the path that
//! closes it. The execution order is then produced by repeatedly taking the
//! ready step with the smallest `(order_hint, input position)`, so identical
//! input always yields identical output.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use thiserror::Error;

use crate::request::SubCommand;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Dependency cycle detected at sub-command {command_id}: {}", cycle.join(" -> "))]
    Cycle {
        command_id: String,
        cycle: Vec<String>,
    },

    #[error("Sub-command {command_id} depends on unknown sub-command {dependency}")]
    UnknownDependency {
        command_id: String,
        dependency: String,
    },

    #[error("Duplicate sub-command id: {0}")]
    DuplicateId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Order `commands` so every step follows its dependencies.
///
/// Pure: nothing is executed. Never returns a partial ordering.
pub fn resolve(commands: &[SubCommand]) -> Result<Vec<SubCommand>, ResolveError> {
    let index = index_commands(commands)?;
    let deps = dependency_indices(commands, &index)?;

    detect_cycle(commands, &deps)?;

    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); commands.len()];
    for (node, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<(i64, usize)>> = remaining
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(i, _)| Reverse((commands[i].order_hint, i)))
        .collect();

    let mut ordered = Vec::with_capacity(commands.len());
    while let Some(Reverse((_, node))) = ready.pop() {
        ordered.push(commands[node].clone());
        for &next in &dependents[node] {
            remaining[next] -= 1;
            if remaining[next] == 0 {
                ready.push(Reverse((commands[next].order_hint, next)));
            }
        }
    }

    debug_assert_eq!(ordered.len(), commands.len());
    Ok(ordered)
}

fn index_commands(commands: &[SubCommand]) -> Result<HashMap<&str, usize>, ResolveError> {
    let mut index = HashMap::with_capacity(commands.len());
    for (i, cmd) in commands.iter().enumerate() {
        if index.insert(cmd.id.as_str(), i).is_some() {
            return Err(ResolveError::DuplicateId(cmd.id.clone()));
        }
    }
    Ok(index)
}

fn dependency_indices(
    commands: &[SubCommand],
    index: &HashMap<&str, usize>,
) -> Result<Vec<Vec<usize>>, ResolveError> {
    commands
        .iter()
        .map(|cmd| {
            let mut deps = cmd
                .depends_on
                .iter()
                .map(|dep| {
                    index
                        .get(dep.as_str())
                        .copied()
                        .ok_or_else(|| ResolveError::UnknownDependency {
                            command_id: cmd.id.clone(),
                            dependency: dep.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            // Visit dependencies in tie-break order so the reported cycle is stable.
            deps.sort_by_key(|&d| (commands[d].order_hint, d));
            Ok(deps)
        })
        .collect()
}

fn detect_cycle(commands: &[SubCommand], deps: &[Vec<usize>]) -> Result<(), ResolveError> {
    let mut marks = vec![Mark::Unvisited; commands.len()];
    let mut roots: Vec<usize> = (0..commands.len()).collect();
    roots.sort_by_key(|&i| (commands[i].order_hint, i));

    for root in roots {
        if marks[root] != Mark::Unvisited {
            continue;
        }

        // Explicit stack of (node, next dependency position) keeps deep chains off the call stack.
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::InProgress;

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            if let Some(&dep) = deps[node].get(frame.1) {
                frame.1 += 1;
                match marks[dep] {
                    Mark::Unvisited => {
                        marks[dep] = Mark::InProgress;
                        stack.push((dep, 0));
                    }
                    Mark::InProgress => {
                        let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&(n, _)| commands[n].id.clone())
                            .collect();
                        cycle.push(commands[dep].id.clone());
                        return Err(ResolveError::Cycle {
                            command_id: commands[dep].id.clone(),
                            cycle,
                        });
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
            }
        }
    }

    Ok(())
}
