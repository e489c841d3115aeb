//! Compilation and execution reports.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;
use crate::error::Result;
use crate::ir::{Phase, TensorId};

use super::executable::Executable;
use super::runtime::ExecutionCounters;

/// Per tensor, per tile, the element intervals `[start, end)` held there.
pub type TensorTileMap = BTreeMap<TensorId, Vec<Vec<(usize, usize)>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub device_type: String,
    pub num_ipus: u32,
    pub tiles_per_ipu: u32,
    pub num_virtual_graphs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpReport {
    pub name: String,
    pub op_type: String,
    pub phase: Phase,
    pub virtual_graph: i64,
    pub outputs: Vec<TensorReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorReport {
    pub id: TensorId,
    pub dtype: String,
    pub shape: Vec<i64>,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphReport {
    pub target: TargetReport,
    pub ops: Vec<OpReport>,
    /// Bytes of tensors resident on each virtual graph.
    pub memory_per_virtual_graph: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub target: TargetReport,
    pub steps: u64,
    pub micro_batches: u64,
    pub op_executions: u64,
    pub inplace_executions: u64,
    pub fragment_runs: BTreeMap<String, u64>,
}

fn target(executable: &Executable, device: &DeviceInfo) -> TargetReport {
    TargetReport {
        device_type: device.device_type().to_string(),
        num_ipus: device.num_ipus(),
        tiles_per_ipu: device.tiles_per_ipu(),
        num_virtual_graphs: executable.num_virtual_graphs,
    }
}

pub fn summary_report(executable: &Executable, device: &DeviceInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Target:");
    let _ = writeln!(out, "  Device type: {}", device.device_type());
    let _ = writeln!(out, "  Number of IPUs: {}", device.num_ipus());
    let _ = writeln!(out, "  Tiles per IPU: {}", device.tiles_per_ipu());
    let _ = writeln!(out, "  Virtual graphs: {}", executable.num_virtual_graphs);
    let _ = writeln!(out, "Program:");
    for (n, op) in executable.ops().enumerate() {
        let _ = writeln!(out, "  OnTileExecute {n}: {}/{}", op.display_type(), op.name);
    }
    out
}

pub fn graph_report(executable: &Executable, device: &DeviceInfo) -> GraphReport {
    let mut memory = vec![0usize; executable.num_virtual_graphs.max(1)];
    let ops = executable
        .ops()
        .map(|op| {
            let outputs = op
                .outputs
                .iter()
                .zip(&op.output_infos)
                .map(|(id, info)| TensorReport {
                    id: id.clone(),
                    dtype: info.dtype.name().to_string(),
                    shape: info.shape.clone(),
                    bytes: info.nbytes(),
                })
                .collect::<Vec<_>>();
            if let Some(slot) = memory.get_mut(op.virtual_graph.max(0) as usize) {
                *slot += outputs.iter().map(|t| t.bytes).sum::<usize>();
            }
            OpReport {
                name: op.name.clone(),
                op_type: op.display_type(),
                phase: op.phase,
                virtual_graph: op.virtual_graph,
                outputs,
            }
        })
        .collect();
    GraphReport {
        target: target(executable, device),
        ops,
        memory_per_virtual_graph: memory,
    }
}

pub fn execution_report(
    executable: &Executable,
    device: &DeviceInfo,
    counters: &ExecutionCounters,
) -> ExecutionReport {
    ExecutionReport {
        target: target(executable, device),
        steps: counters.steps,
        micro_batches: counters.micro_batches,
        op_executions: counters.op_executions,
        inplace_executions: counters.inplace_executions,
        fragment_runs: counters
            .fragment_runs
            .iter()
            .map(|(phase, runs)| (format!("{phase:?}"), *runs))
            .collect(),
    }
}

/// JSON, or bincode when `binary`.
pub fn encode<T: Serialize>(report: &T, binary: bool) -> Result<Vec<u8>> {
    if binary {
        Ok(bincode::serialize(report)?)
    } else {
        Ok(serde_json::to_vec_pretty(report)?)
    }
}

/// Linear tile layout: each tensor is spread over the tiles of its virtual
/// graph in chunks of `ceil(nelms / tilesPerIpu)` elements.
pub fn tensor_tile_map(executable: &Executable, device: &DeviceInfo) -> TensorTileMap {
    let tiles_per_ipu = device.tiles_per_ipu().max(1) as usize;
    let total_tiles = tiles_per_ipu * device.num_ipus().max(1) as usize;
    let mut map = TensorTileMap::new();
    for (id, info) in &executable.tensor_infos {
        let mut tiles = vec![Vec::new(); total_tiles];
        let nelms = info.nelms();
        if info.rank() == 0 {
            tiles[0].push((0, 1));
            map.insert(id.clone(), tiles);
            continue;
        }
        let first = executable.virtual_graph_of(id).max(0) as usize * tiles_per_ipu;
        let grain = nelms.div_ceil(tiles_per_ipu).max(1);
        for (k, start) in (0..nelms).step_by(grain).enumerate() {
            if let Some(tile) = tiles.get_mut(first + k) {
                tile.push((start, (start + grain).min(nelms)));
            }
        }
        map.insert(id.clone(), tiles);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceManager;
    use crate::tensor::TensorInfo;

    fn executable_with(infos: &[(&str, TensorInfo)]) -> Executable {
        Executable {
            graph_hash: 0,
            num_virtual_graphs: 1,
            fragments: BTreeMap::new(),
            streams: Vec::new(),
            variables: Vec::new(),
            optimizer_streams: Vec::new(),
            constants: Vec::new(),
            weight_updates: Vec::new(),
            tensor_infos: infos
                .iter()
                .map(|(id, info)| (id.to_string(), info.clone()))
                .collect(),
        }
    }

    #[test]
    fn tile_map_uses_ceil_grain() {
        let mut opts = BTreeMap::new();
        opts.insert("tilesPerIPU".to_string(), "4".to_string());
        let device = DeviceManager::global()
            .create_ipu_model_device(&opts)
            .expect("device");
        let exe = executable_with(&[
            ("v", TensorInfo::float([10])),
            ("s", TensorInfo::float(Vec::<i64>::new())),
        ]);
        let map = tensor_tile_map(&exe, &device);
        assert_eq!(
            map["v"],
            vec![vec![(0, 3)], vec![(3, 6)], vec![(6, 9)], vec![(9, 10)]]
        );
        assert_eq!(map["s"][0], vec![(0, 1)]);
        assert!(map["s"][1..].iter().all(Vec::is_empty));
    }
}
