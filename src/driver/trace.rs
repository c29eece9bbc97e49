use crate::graph::{GraphNode, OperationGraph};
use crate::prelude::*;
use crate::types::{NodeReport, RunReport, TaskRecord};
use serde_json::{json, Value as Json};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Appends one JSON document per line describing the executed graph and its run report.
#[derive(Debug)]
pub(super) struct RunTrace {
    file: File,
}

impl RunTrace {
    pub(super) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open trace file {:?}", path))?;
        info!("writing trace to: {:?}", path);

        Ok(Self { file })
    }

    pub(super) fn add_graph(&mut self, graph: &OperationGraph) {
        let nodes = graph.nodes().map(|n| self.process_node(graph, n)).collect_vec();
        let stats = graph.stats();

        self.write(json!({
            "kind": "graph",
            "nodes": nodes,
            "terminals": graph.terminals().map(|id| id.get()).collect_vec(),
            "stats": {
                "num_arrays": stats.num_arrays,
                "num_tasks": stats.num_tasks,
                "total_nbytes": stats.total_nbytes,
                "max_projected_mem": stats.max_projected_mem,
            },
        }));
    }

    pub(super) fn add_report(&mut self, report: &RunReport) {
        self.write(json!({
            "kind": "report",
            "wall_time": report.wall_time.as_secs_f64(),
            "nodes": report.nodes.values().map(|n| self.process_report(n)).collect_vec(),
            "tasks": report.tasks.iter().map(|t| self.process_task(t)).collect_vec(),
        }));
    }

    fn write(&mut self, value: Json) {
        if let Err(e) = serde_json::to_writer(&self.file, &value) {
            warn!("writing trace failed: {}", e);
        }

        if let Err(e) = self.file.write_all(b"\n") {
            warn!("writing trace failed: {}", e);
        }
    }

    fn process_node(&self, graph: &OperationGraph, node: &GraphNode) -> Json {
        let desc = &node.descriptor;

        json!({
            "id": node.id.get(),
            "op": node.op.name(),
            "label": node.op.label(),
            "inputs": node.op.inputs().iter().map(|id| id.get()).collect_vec(),
            "shape": desc.shape(),
            "chunks": desc.chunks(),
            "dtype": desc.dtype().name(),
            "num_tasks": node.num_tasks,
            "projected_mem": node.projected_mem_per_task,
            "terminal": graph.is_terminal(node.id),
        })
    }

    fn process_report(&self, node: &NodeReport) -> Json {
        json!({
            "id": node.node_id.get(),
            "op": node.op_name,
            "outcome": node.outcome,
            "num_tasks": node.num_tasks,
            "projected_mem": node.projected_mem,
            "peak_mem": node.peak_mem_observed,
            "utilization": node.utilization(),
            "wall_time": node.wall_time.as_secs_f64(),
            "store": node.descriptor.store().key(),
        })
    }

    fn process_task(&self, task: &TaskRecord) -> Json {
        json!({
            "node_id": task.task_id.node.get(),
            "index": task.task_id.index,
            "outcome": task.outcome,
            "attempts": task.attempts_used,
            "backups": task.backups_launched,
            "backup_won": task.backup_won,
            "worker": task.worker.map(|w| w.get()),
            "peak_mem": task.peak_mem_observed,
            "wall_time": task.wall_time.as_secs_f64(),
            "error": task.last_error.as_ref().map(|e| e.to_string()),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::test::{source, unary};
    use crate::types::PlanConfig;
    use std::io::{BufRead, BufReader};

    #[test]
    fn test_trace_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");

        let mut g = OperationGraph::new(PlanConfig::new(10_000, 0));
        let a = source(&mut g, "a", &[4], &[2]);
        let b = unary(&mut g, "neg", a);
        g.mark_terminal(b).unwrap();

        let mut trace = RunTrace::new(&path).unwrap();
        trace.add_graph(&g);
        trace.add_report(&RunReport::default());
        drop(trace);

        let lines = BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(|l| serde_json::from_str::<Json>(&l.unwrap()).unwrap())
            .collect_vec();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "graph");
        assert_eq!(lines[0]["nodes"][1]["label"], "neg(#0)");
        assert_eq!(lines[0]["nodes"][1]["num_tasks"], 2);
        assert_eq!(lines[0]["terminals"][0], b.get());
        assert_eq!(lines[1]["kind"], "report");
    }
}
