use super::{OperationGraph, Operation};
use std::fmt::Write;
use tessera_core::util::format_bytes;

impl OperationGraph {
    /// Render the graph in Graphviz dot format.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = self.write_dot(&mut out);
        out
    }

    fn write_dot(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "digraph {{")?;
        writeln!(out, "  node [shape=box, fontname=\"monospace\"];")?;

        for node in self.nodes() {
            let desc = &node.descriptor;
            let mut label = format!(
                "{}: {}\\nshape={:?} chunks={:?} {}",
                node.id,
                escape(&node.op.label()),
                desc.shape(),
                desc.chunks(),
                desc.dtype()
            );

            if !node.op.is_source() {
                write!(
                    label,
                    "\\ntasks={} projected_mem={}",
                    node.num_tasks,
                    format_bytes(node.projected_mem_per_task)
                )?;
            }

            let style = match (&node.op, self.is_terminal(node.id)) {
                (_, true) => ", style=bold",
                (Operation::Source, false) => ", style=dashed",
                _ => "",
            };

            writeln!(out, "  n{} [label=\"{}\"{}];", node.id.get(), label, style)?;
        }

        for node in self.nodes() {
            for input in node.op.inputs() {
                writeln!(out, "  n{} -> n{};", input.get(), node.id.get())?;
            }
        }

        writeln!(out, "}}")
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
