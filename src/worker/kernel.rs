use super::MemoryTracker;
use crate::prelude::*;
use std::fmt;
use std::sync::Arc;
use tessera_core::{decode_elements, encode_elements, volume, DataType, Element, Shape};

/// Error for input a kernel can never process, such as an unsupported element type or a block
/// of the wrong shape. Tasks failing with it are not retried.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct InvalidInput(pub String);

macro_rules! invalid_input {
    ($($arg:tt)*) => {
        return Err(Error::new(InvalidInput(format!($($arg)*))))
    };
}

/// Chunk of elements held in worker memory, stored as little-endian bytes in row-major order.
#[derive(Clone, PartialEq)]
pub struct Chunk {
    shape: Shape,
    dtype: DataType,
    data: Vec<u8>,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("shape", &self.shape.as_slice())
            .field("dtype", &self.dtype)
            .field("nbytes", &self.data.len())
            .finish()
    }
}

impl Chunk {
    pub fn new(shape: &[u64], dtype: DataType, data: Vec<u8>) -> Result<Self> {
        let expected = volume(shape) as usize * dtype.size_in_bytes();
        if data.len() != expected {
            invalid_input!(
                "chunk of shape {:?} and type {} needs {} bytes, found {}",
                shape,
                dtype,
                expected,
                data.len()
            );
        }

        Ok(Self {
            shape: shape.iter().copied().collect(),
            dtype,
            data,
        })
    }

    pub fn from_elements<T: Element>(shape: &[u64], values: &[T]) -> Result<Self> {
        Self::new(shape, T::DATA_TYPE, encode_elements(values))
    }

    pub fn to_elements<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DATA_TYPE {
            invalid_input!("expected chunk of {}, found {}", T::DATA_TYPE, self.dtype);
        }

        Ok(decode_elements(&self.data))
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        volume(&self.shape) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Everything a kernel knows about the block it computes.
pub struct KernelContext<'a> {
    coord: &'a [u64],
    shape: Shape,
    dtype: DataType,
    params: &'a str,
    tracker: &'a MemoryTracker,
    scratch: u64,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        coord: &'a [u64],
        shape: Shape,
        dtype: DataType,
        params: &'a str,
        tracker: &'a MemoryTracker,
    ) -> Self {
        Self {
            coord,
            shape,
            dtype,
            params,
            tracker,
            scratch: 0,
        }
    }

    /// Block coordinates of the output chunk.
    pub fn coord(&self) -> &[u64] {
        self.coord
    }

    /// Shape of the output chunk, clipped at the array edge.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn params(&self) -> &str {
        self.params
    }

    /// Parse the parameters of the function, e.g. a scalar operand.
    pub fn parse_params<T>(&self) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: StdError + Send + Sync + 'static,
    {
        self.params.trim().parse().map_err(|e| {
            Error::new(InvalidInput(format!(
                "invalid kernel parameters {:?}: {}",
                self.params, e
            )))
        })
    }

    /// Record `nbytes` of intermediate memory held by the kernel until it returns.
    pub fn track_scratch(&mut self, nbytes: u64) {
        self.tracker.allocate(nbytes);
        self.scratch += nbytes;
    }

    /// Build the output chunk from its elements. The chunk counts as scratch memory until the
    /// kernel returns.
    pub fn output_chunk<T: Element>(&mut self, values: &[T]) -> Result<Chunk> {
        if T::DATA_TYPE != self.dtype {
            invalid_input!("kernel produced {} elements, expected {}", T::DATA_TYPE, self.dtype);
        }

        let chunk = Chunk::from_elements(&self.shape, values)?;
        self.track_scratch(chunk.nbytes());
        Ok(chunk)
    }
}

impl Drop for KernelContext<'_> {
    fn drop(&mut self) {
        self.tracker.release(self.scratch);
    }
}

/// Computes one output chunk. `args[i]` holds the blocks of argument `i` needed for this chunk,
/// in row-major order of their block coordinates: one block, unless the argument is contracted.
pub trait Kernel: Send + Sync {
    fn call(&self, ctx: &mut KernelContext<'_>, args: &[Vec<Chunk>]) -> Result<Chunk>;
}

impl<F> Kernel for F
where
    F: Fn(&mut KernelContext<'_>, &[Vec<Chunk>]) -> Result<Chunk> + Send + Sync,
{
    fn call(&self, ctx: &mut KernelContext<'_>, args: &[Vec<Chunk>]) -> Result<Chunk> {
        (self)(ctx, args)
    }
}

/// Kernels available on a worker, by function name.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Arc<dyn Kernel>>,
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kernels.keys().sorted()).finish()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        default()
    }

    /// Registry holding the elementwise kernels that ship with tessera: `neg`, `abs`, `sqrt`,
    /// `scale` (by the float in its parameters), `add`, `sub`, `mul` and `sum_blocks`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("neg", unary_numeric(|x: i64| x.wrapping_neg(), |x: f64| -x))
            .register("abs", unary_numeric(|x: i64| x.wrapping_abs(), f64::abs))
            .register("sqrt", map_elements(f64::sqrt))
            .register("scale", |ctx: &mut KernelContext<'_>, args: &[Vec<Chunk>]| {
                let factor: f64 = ctx.parse_params()?;
                map_elements(move |x: f64| x * factor).call(ctx, args)
            })
            .register("add", binary_numeric(i64::wrapping_add, |a: f64, b| a + b))
            .register("sub", binary_numeric(i64::wrapping_sub, |a: f64, b| a - b))
            .register("mul", binary_numeric(i64::wrapping_mul, |a: f64, b| a * b))
            .register("sum_blocks", sum_blocks);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, kernel: impl Kernel + 'static) -> &mut Self {
        let name = name.into();
        if self.kernels.insert(name.clone(), Arc::new(kernel)).is_some() {
            debug!("replaced kernel {:?}", name);
        }

        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn Kernel> {
        self.kernels.get(name).map(|k| &**k)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }
}

fn single_block<'a>(args: &'a [Vec<Chunk>], index: usize) -> Result<&'a Chunk> {
    match args.get(index).map(Vec::as_slice) {
        Some([chunk]) => Ok(chunk),
        Some(blocks) => invalid_input!("argument {} has {} blocks, expected one", index, blocks.len()),
        None => invalid_input!("missing argument {}", index),
    }
}

/// Kernel applying `f` to every element of its single argument.
pub fn map_elements<T, F>(f: F) -> impl Kernel
where
    T: Element,
    F: Fn(T) -> T + Send + Sync,
{
    move |ctx: &mut KernelContext<'_>, args: &[Vec<Chunk>]| {
        let input = single_block(args, 0)?;
        ctx.track_scratch(input.nbytes());

        let values = input.to_elements::<T>()?.into_iter().map(&f).collect_vec();
        ctx.output_chunk(&values)
    }
}

/// Kernel combining the elements of its two arguments pairwise. Both blocks must have the same
/// shape.
pub fn zip_elements<T, F>(f: F) -> impl Kernel
where
    T: Element,
    F: Fn(T, T) -> T + Send + Sync,
{
    move |ctx: &mut KernelContext<'_>, args: &[Vec<Chunk>]| {
        let (lhs, rhs) = (single_block(args, 0)?, single_block(args, 1)?);
        if lhs.shape() != rhs.shape() {
            invalid_input!(
                "cannot combine blocks of shape {:?} and {:?}",
                lhs.shape(),
                rhs.shape()
            );
        }

        ctx.track_scratch(lhs.nbytes() + rhs.nbytes());
        let values = zip(lhs.to_elements::<T>()?, rhs.to_elements::<T>()?)
            .map(|(a, b)| f(a, b))
            .collect_vec();
        ctx.output_chunk(&values)
    }
}

fn unary_numeric(
    fi: impl Fn(i64) -> i64 + Send + Sync + 'static,
    ff: impl Fn(f64) -> f64 + Send + Sync + 'static,
) -> impl Kernel {
    let (fi, ff) = (map_elements(fi), map_elements(ff));

    move |ctx: &mut KernelContext<'_>, args: &[Vec<Chunk>]| match ctx.dtype() {
        DataType::I64 => fi.call(ctx, args),
        DataType::F64 => ff.call(ctx, args),
        other => invalid_input!("unsupported data type {}", other),
    }
}

fn binary_numeric(
    fi: impl Fn(i64, i64) -> i64 + Send + Sync + 'static,
    ff: impl Fn(f64, f64) -> f64 + Send + Sync + 'static,
) -> impl Kernel {
    let (fi, ff) = (zip_elements(fi), zip_elements(ff));

    move |ctx: &mut KernelContext<'_>, args: &[Vec<Chunk>]| match ctx.dtype() {
        DataType::I64 => fi.call(ctx, args),
        DataType::F64 => ff.call(ctx, args),
        other => invalid_input!("unsupported data type {}", other),
    }
}

/// Elementwise sum over all blocks of the first argument. Combined with a contraction mapping
/// this adds up blocks along the contracted axes, e.g. `ij -> j` sums the row blocks of a
/// matrix. Every block must have the shape of the output chunk.
fn sum_blocks(ctx: &mut KernelContext<'_>, args: &[Vec<Chunk>]) -> Result<Chunk> {
    let blocks = args.get(0).map(Vec::as_slice).unwrap_or_default();
    if blocks.is_empty() {
        invalid_input!("sum_blocks needs at least one block");
    }

    if let Some(block) = blocks.iter().find(|b| b.shape() != ctx.shape()) {
        invalid_input!(
            "block of shape {:?} does not match output shape {:?}",
            block.shape(),
            ctx.shape()
        );
    }

    fn sum<T: Element + std::ops::Add<Output = T>>(
        ctx: &mut KernelContext<'_>,
        blocks: &[Chunk],
    ) -> Result<Chunk> {
        let mut total = blocks[0].to_elements::<T>()?;
        ctx.track_scratch(blocks[0].nbytes());

        for block in &blocks[1..] {
            for (t, v) in zip(&mut total, block.to_elements::<T>()?) {
                *t = *t + v;
            }
        }

        ctx.output_chunk(&total)
    }

    match ctx.dtype() {
        DataType::I64 => sum::<i64>(ctx, blocks),
        DataType::F64 => sum::<f64>(ctx, blocks),
        other => invalid_input!("unsupported data type {}", other),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn call(
        registry: &KernelRegistry,
        name: &str,
        params: &str,
        args: &[Vec<Chunk>],
    ) -> Result<Chunk> {
        let tracker = MemoryTracker::new();
        let shape = args[0][0].shape().iter().copied().collect();
        let dtype = args[0][0].dtype();
        let mut ctx = KernelContext::new(&[0], shape, dtype, params, &tracker);

        registry.get(name).unwrap().call(&mut ctx, args)
    }

    #[test]
    fn test_chunk() {
        let chunk = Chunk::from_elements(&[2, 2], &[1i32, 2, 3, 4]).unwrap();
        assert_eq!(chunk.nbytes(), 16);
        assert_eq!(chunk.len(), 4);
        assert_eq!(chunk.to_elements::<i32>().unwrap(), vec![1, 2, 3, 4]);
        assert!(chunk.to_elements::<f32>().is_err());
        assert!(Chunk::from_elements(&[3], &[1i32, 2]).is_err());
    }

    #[test]
    fn test_builtins() {
        let registry = KernelRegistry::with_builtins();
        let a = Chunk::from_elements(&[3], &[1.0f64, -4.0, 9.0]).unwrap();
        let b = Chunk::from_elements(&[3], &[2.0f64, 2.0, 2.0]).unwrap();

        let out = call(&registry, "abs", "", &[vec![a.clone()]]).unwrap();
        assert_eq!(out.to_elements::<f64>().unwrap(), vec![1.0, 4.0, 9.0]);

        let out = call(&registry, "mul", "", &[vec![a.clone()], vec![b]]).unwrap();
        assert_eq!(out.to_elements::<f64>().unwrap(), vec![2.0, -8.0, 18.0]);

        let out = call(&registry, "scale", "0.5", &[vec![a.clone()]]).unwrap();
        assert_eq!(out.to_elements::<f64>().unwrap(), vec![0.5, -2.0, 4.5]);
        let err = call(&registry, "scale", "half", &[vec![a.clone()]]).unwrap_err();
        assert!(err.downcast_ref::<InvalidInput>().is_some());

        let ints = Chunk::from_elements(&[2], &[3i64, -5]).unwrap();
        let out = call(&registry, "neg", "", &[vec![ints.clone()]]).unwrap();
        assert_eq!(out.to_elements::<i64>().unwrap(), vec![-3, 5]);

        let out = call(&registry, "sum_blocks", "", &[vec![ints.clone(), ints.clone()]]).unwrap();
        assert_eq!(out.to_elements::<i64>().unwrap(), vec![6, -10]);

        // Integers have no square root.
        let err = call(&registry, "sqrt", "", &[vec![ints]]).unwrap_err();
        assert!(err.downcast_ref::<InvalidInput>().is_some());

        assert!(registry.get("conv").is_none());
    }

    #[test]
    fn test_scratch_is_released() {
        let tracker = MemoryTracker::new();
        let input = Chunk::from_elements(&[4], &[1i64, 2, 3, 4]).unwrap();

        {
            let mut ctx = KernelContext::new(&[0], Shape::from_slice(&[4]), DataType::I64, "", &tracker);
            let out = map_elements(|x: i64| x * 2).call(&mut ctx, &[vec![input]]).unwrap();
            assert_eq!(out.to_elements::<i64>().unwrap(), vec![2, 4, 6, 8]);
        }

        // Decoded input plus output.
        assert_eq!(tracker.current(), 0);
        assert_eq!(tracker.peak(), 64);
    }
}
