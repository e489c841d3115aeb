//! Assignment of ops to virtual graphs.
//!
//! Forward ops are grouped into chains ("subgraphs"), chains are split into
//! stages until there are enough of them, and the ordered stages are packed
//! contiguously into partitions of roughly equal cost. Every other op follows
//! the forward op it was derived from.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::ir::{Graph, Op, OpId, OpKind, Phase};
use crate::logging::{Diagnostic, DiagnosticSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMode {
    /// Split automatically into exactly `virtual_graphs` partitions.
    Auto { virtual_graphs: usize },
    /// Every forward op carries a builder-assigned id below `virtual_graphs`.
    Manual { virtual_graphs: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSummary {
    pub stages: usize,
    pub virtual_graphs: usize,
    /// Total cost per virtual graph.
    pub costs: Vec<u64>,
}

/// Cost estimate used for balancing.
pub fn op_cost(graph: &Graph, op: &Op, training: bool) -> u64 {
    let out = graph.info(op.output()).map(|i| i.nelms() as u64).unwrap_or(0);
    match op.kind {
        OpKind::MatMul => {
            let k = op
                .inputs
                .first()
                .and_then(|a| graph.info(a).ok())
                .and_then(|a| a.shape.last().copied())
                .unwrap_or(1)
                .max(1) as u64;
            let cost = 2 * out * k;
            if training {
                3 * cost
            } else {
                cost
            }
        }
        _ if training => 2 * out,
        _ => out,
    }
}

#[derive(Debug, Clone)]
struct Stage {
    ops: Vec<OpId>,
    costs: Vec<u64>,
    first_position: usize,
}

impl Stage {
    fn cost(&self) -> u64 {
        self.costs.iter().sum()
    }

    /// Index after which to split, or `None` when the stage is a single op.
    fn split_point(&self) -> Option<usize> {
        if self.ops.len() < 2 {
            return None;
        }
        let half = self.cost() as f64 * 0.5;
        let mut best: Option<(usize, f64)> = None;
        let mut cumulative = 0u64;
        for i in 0..self.ops.len() - 1 {
            cumulative += self.costs[i];
            let distance = (cumulative as f64 - half).abs();
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }
        best.map(|(i, _)| i)
    }
}

/// Assigns a virtual graph to every op of `graph`.
pub fn partition(
    graph: &mut Graph,
    mode: PartitionMode,
    training: bool,
    sink: &dyn DiagnosticSink,
) -> Result<PartitionSummary> {
    let order = graph.topo_order()?;
    let position: BTreeMap<OpId, usize> = order.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let forward: Vec<OpId> = order
        .iter()
        .copied()
        .filter(|id| graph.op(*id).is_some_and(|op| op.phase == Phase::Forward))
        .collect();

    let (assignment, stages, virtual_graphs) = match mode {
        PartitionMode::Auto { virtual_graphs } => {
            let stages = auto_stages(graph, &forward, &position, virtual_graphs, training)?;
            let assignment = group_stages(&stages, virtual_graphs);
            (assignment, stages.len(), virtual_graphs)
        }
        PartitionMode::Manual { virtual_graphs } => {
            let mut assignment = BTreeMap::new();
            for &id in &forward {
                let Some(op) = graph.op(id) else {
                    continue;
                };
                match op.virtual_graph {
                    Some(v) if v >= 0 && (v as usize) < virtual_graphs => {
                        assignment.insert(id, v);
                    }
                    Some(v) => {
                        return Err(Error::config(format!(
                            "op '{}' has virtual graph {v}, but only {virtual_graphs} are available",
                            op.name
                        )))
                    }
                    None => {
                        return Err(Error::config(format!(
                            "op '{}' has no virtual graph id although virtual graphs are enabled",
                            op.name
                        )))
                    }
                }
            }
            let used = assignment.values().collect::<BTreeSet<_>>().len();
            (assignment, used, virtual_graphs)
        }
    };

    for (&id, &v) in &assignment {
        if let Some(op) = graph.op_mut(id) {
            op.virtual_graph = Some(v);
        }
    }
    place_followers(graph, &order)?;
    if matches!(mode, PartitionMode::Auto { .. }) {
        validate_assignment(graph, virtual_graphs)?;
    }

    let mut costs = vec![0u64; virtual_graphs];
    for op in graph.ops() {
        if let Some(v) = op.virtual_graph {
            if let Some(slot) = costs.get_mut(v as usize) {
                *slot += op_cost(graph, op, training);
            }
        }
    }
    sink.emit(Diagnostic::Partitioned {
        stages,
        virtual_graphs,
    });
    Ok(PartitionSummary {
        stages,
        virtual_graphs,
        costs,
    })
}

fn auto_stages(
    graph: &Graph,
    forward: &[OpId],
    position: &BTreeMap<OpId, usize>,
    wanted: usize,
    training: bool,
) -> Result<Vec<Stage>> {
    let mut subgraph_of: BTreeMap<OpId, usize> = BTreeMap::new();
    let mut stages: Vec<Stage> = Vec::new();
    for &id in forward {
        let Some(op) = graph.op(id) else {
            continue;
        };
        let owners: BTreeSet<usize> = graph
            .op_dependencies(op)
            .iter()
            .filter_map(|p| subgraph_of.get(p).copied())
            .collect();
        let single_owner = match owners.len() {
            1 => owners.first().copied(),
            _ => None,
        };
        let index = match single_owner {
            Some(owner) => owner,
            None => {
                stages.push(Stage {
                    ops: Vec::new(),
                    costs: Vec::new(),
                    first_position: position.get(&id).copied().unwrap_or(0),
                });
                stages.len() - 1
            }
        };
        subgraph_of.insert(id, index);
        stages[index].ops.push(id);
        stages[index].costs.push(op_cost(graph, op, training));
    }

    while stages.len() < wanted {
        let candidate = stages
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.split_point().map(|at| (i, at, s.cost())))
            .fold(None, |best: Option<(usize, usize, u64)>, cur| match best {
                Some(b) if b.2 >= cur.2 => Some(b),
                _ => Some(cur),
            });
        let Some((index, at, _)) = candidate else {
            return Err(Error::Partition(format!(
                "Couldn't find enough splits. Found {} stages but {wanted} virtual graphs were requested",
                stages.len()
            )));
        };
        let stage = &mut stages[index];
        let tail_ops = stage.ops.split_off(at + 1);
        let tail_costs = stage.costs.split_off(at + 1);
        let first_position = position.get(&tail_ops[0]).copied().unwrap_or(0);
        stages.push(Stage {
            ops: tail_ops,
            costs: tail_costs,
            first_position,
        });
    }

    stages.sort_by_key(|s| s.first_position);
    Ok(stages)
}

/// Packs ordered stages into `n` contiguous non-empty groups, moving to the
/// next group once the running cost reaches its share.
fn group_stages(stages: &[Stage], n: usize) -> BTreeMap<OpId, i64> {
    let total: u64 = stages.iter().map(Stage::cost).sum();
    let mut assignment = BTreeMap::new();
    let mut partition = 0usize;
    let mut cumulative = 0u64;
    for (s, stage) in stages.iter().enumerate() {
        for &id in &stage.ops {
            assignment.insert(id, partition as i64);
        }
        cumulative += stage.cost();
        let stages_left = stages.len() - s - 1;
        let partitions_left = n.saturating_sub(partition + 1);
        let share = total as f64 * (partition + 1) as f64 / n as f64;
        if partitions_left > 0 && (stages_left <= partitions_left || cumulative as f64 >= share) {
            partition += 1;
        }
    }
    assignment
}

/// Places loss, gradient and update ops with their forward counterparts.
fn place_followers(graph: &mut Graph, order: &[OpId]) -> Result<()> {
    for &id in order {
        let Some(op) = graph.op(id) else {
            continue;
        };
        if op.phase == Phase::Forward {
            continue;
        }
        let from_forward = op
            .fwd_op
            .and_then(|f| graph.op(f))
            .and_then(|f| f.virtual_graph);
        let from_weight_user = match op.kind {
            OpKind::SgdVarUpdate => op
                .inputs
                .first()
                .map(|w| graph.consumers(w))
                .unwrap_or_default()
                .into_iter()
                .filter_map(|c| graph.op(c))
                .find(|c| c.phase == Phase::Forward)
                .and_then(|c| c.virtual_graph),
            _ => None,
        };
        let from_producers = op
            .inputs
            .iter()
            .filter_map(|i| graph.producer(i))
            .filter_map(|p| graph.op(p))
            .filter_map(|p| p.virtual_graph)
            .max();
        let v = from_forward
            .or(from_weight_user)
            .or(from_producers)
            .unwrap_or(0);
        if let Some(op) = graph.op_mut(id) {
            op.virtual_graph = Some(v);
        }
    }
    Ok(())
}

/// Checks that forward partition edges only go forward and no partition in
/// `0..n` is empty.
pub fn validate_assignment(graph: &Graph, n: usize) -> Result<()> {
    let mut used = vec![false; n];
    for op in graph.ops().filter(|op| op.phase == Phase::Forward) {
        let v = op
            .virtual_graph
            .ok_or_else(|| Error::Partition(format!("op '{}' is not assigned", op.name)))?;
        let slot = used.get_mut(v as usize).ok_or_else(|| {
            Error::Partition(format!("op '{}' assigned to {v} of {n}", op.name))
        })?;
        *slot = true;
        for dep in graph.op_dependencies(op) {
            let Some(producer) = graph.op(dep) else {
                continue;
            };
            if producer.virtual_graph.unwrap_or(0) > v {
                return Err(Error::Partition(format!(
                    "op '{}' on {v} depends on '{}' on a later virtual graph",
                    op.name, producer.name
                )));
            }
        }
    }
    if let Some(empty) = used.iter().position(|u| !u) {
        return Err(Error::Partition(format!("virtual graph {empty} is empty")));
    }
    Ok(())
}
