use super::BlockMapping;
use crate::prelude::*;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use tessera_core::{ChunkGrid, DataType, Shape};

/// Names a kernel in the worker's kernel registry together with the parameters it is invoked
/// with and the information the memory model needs about it.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Function {
    pub name: String,

    /// Opaque parameters passed to the kernel, for example a scalar operand.
    pub params: String,

    /// Intermediate memory the kernel needs, as a multiple of its output chunk size.
    pub multiplier: f64,

    /// Additional bytes the kernel needs regardless of the chunk size (for example a side input
    /// it loads itself).
    pub extra_mem: u64,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: String::new(),
            multiplier: 1.0,
            extra_mem: 0,
        }
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_extra_mem(mut self, extra_mem: u64) -> Self {
        self.extra_mem = extra_mem;
        self
    }
}

/// Expression evaluated by a blockwise task.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum BlockExpr {
    /// Chunks read from the input array in the given slot of the enclosing node.
    Input(usize),

    /// Chunks produced in memory by applying another function.
    Apply(Box<Application>),
}

impl BlockExpr {
    /// Number of blocks along each axis of the array this expression produces.
    pub fn num_blocks(&self, input_blocks: &[Shape]) -> Shape {
        match self {
            BlockExpr::Input(slot) => input_blocks[*slot].clone(),
            BlockExpr::Apply(app) => app.num_blocks(),
        }
    }
}

/// One argument of an application: an expression and the mapping that selects which of its
/// blocks are read for an output block.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct BlockArg {
    pub mapping: BlockMapping,
    pub expr: BlockExpr,
}

/// A function applied to its arguments, producing an array with the given grid and type.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Application {
    pub function: Function,
    pub args: Vec<BlockArg>,
    pub grid: ChunkGrid,
    pub dtype: DataType,
}

impl Application {
    pub fn num_blocks(&self) -> Shape {
        self.grid.num_blocks()
    }

    /// Size in bytes of a nominal output chunk.
    pub fn chunk_nbytes(&self) -> u64 {
        self.grid.chunk_volume() * self.dtype.size_in_bytes() as u64
    }

    /// Distinct input slots referenced anywhere in this expression tree, in order of first use.
    pub fn leaf_slots(&self) -> Vec<usize> {
        let mut slots = vec![];
        self.visit_leaves(&mut |slot| {
            if !slots.contains(&slot) {
                slots.push(slot);
            }
        });
        slots
    }

    fn visit_leaves(&self, f: &mut dyn FnMut(usize)) {
        for arg in &self.args {
            match &arg.expr {
                BlockExpr::Input(slot) => f(*slot),
                BlockExpr::Apply(inner) => inner.visit_leaves(f),
            }
        }
    }

    /// Rewrite every input slot using `f`.
    pub fn remap_slots(&mut self, f: &dyn Fn(usize) -> usize) {
        for arg in &mut self.args {
            match &mut arg.expr {
                BlockExpr::Input(slot) => *slot = f(*slot),
                BlockExpr::Apply(inner) => inner.remap_slots(f),
            }
        }
    }

    /// Replace every leaf reading `slot` by the given application.
    pub fn substitute(&mut self, slot: usize, replacement: &Application) {
        for arg in &mut self.args {
            if arg.expr == BlockExpr::Input(slot) {
                arg.expr = BlockExpr::Apply(Box::new(replacement.clone()));
            } else if let BlockExpr::Apply(inner) = &mut arg.expr {
                inner.substitute(slot, replacement);
            }
        }
    }

    /// Number of applications in this tree, including this one.
    pub fn num_functions(&self) -> usize {
        1 + self
            .args
            .iter()
            .map(|arg| match &arg.expr {
                BlockExpr::Input(_) => 0,
                BlockExpr::Apply(inner) => inner.num_functions(),
            })
            .sum::<usize>()
    }
}

impl Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.function.name)?;

        for (index, arg) in enumerate(&self.args) {
            if index > 0 {
                f.write_str(", ")?;
            }

            match &arg.expr {
                BlockExpr::Input(slot) => write!(f, "#{}", slot)?,
                BlockExpr::Apply(inner) => write!(f, "{}", inner)?,
            }
        }

        f.write_str(")")
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct BlockwiseOp {
    /// Distinct input nodes. Leaves of `root` refer to positions in this list.
    pub inputs: Vec<NodeId>,
    pub root: Application,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct RechunkOp {
    pub input: NodeId,
    pub target_chunks: Shape,
}

/// The operation that produces the array of a graph node.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Operation {
    /// Array that is already materialized in storage.
    Source,
    Blockwise(BlockwiseOp),
    Rechunk(RechunkOp),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Source => "source",
            Operation::Blockwise(_) => "blockwise",
            Operation::Rechunk(_) => "rechunk",
        }
    }

    /// Distinct nodes this operation reads from.
    pub fn inputs(&self) -> &[NodeId] {
        match self {
            Operation::Source => &[],
            Operation::Blockwise(op) => &op.inputs,
            Operation::Rechunk(op) => std::slice::from_ref(&op.input),
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Operation::Source)
    }

    pub fn as_blockwise(&self) -> Option<&BlockwiseOp> {
        match self {
            Operation::Blockwise(op) => Some(op),
            _ => None,
        }
    }

    /// Short human-readable description, used in logs and graph renderings.
    pub fn label(&self) -> String {
        match self {
            Operation::Source => "source".to_string(),
            Operation::Blockwise(op) => op.root.to_string(),
            Operation::Rechunk(op) => format!("rechunk{:?}", op.target_chunks.as_slice()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf(slot: usize) -> BlockArg {
        BlockArg {
            mapping: BlockMapping::identity(1),
            expr: BlockExpr::Input(slot),
        }
    }

    fn apply(name: &str, args: Vec<BlockArg>) -> Application {
        Application {
            function: Function::new(name),
            args,
            grid: ChunkGrid::new(&[4], &[2]),
            dtype: DataType::F64,
        }
    }

    #[test]
    fn test_substitute() {
        let mut outer = apply("add", vec![leaf(0), leaf(1), leaf(0)]);
        let inner = apply("neg", vec![leaf(2)]);

        outer.substitute(0, &inner);
        assert_eq!(outer.to_string(), "add(neg(#2), #1, neg(#2))");
        assert_eq!(outer.leaf_slots(), vec![2, 1]);
        assert_eq!(outer.num_functions(), 3);

        outer.remap_slots(&|s| if s == 2 { 0 } else { s });
        assert_eq!(outer.to_string(), "add(neg(#0), #1, neg(#0))");
        assert_eq!(outer.chunk_nbytes(), 16);
    }
}
