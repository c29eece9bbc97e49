use super::{chunk_key, store_key, ChunkStore, StoreError};
use crate::prelude::*;
use crate::types::{ArrayDescriptor, StoreRef};
use crossbeam::atomic::AtomicCell;
use rand::distributions::Alphanumeric;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tessera_core::{DataType, Shape};

/// Name of the descriptor file inside every array directory.
pub const DESCRIPTOR_FILE: &str = ".tessera.json";
const TMP_SUFFIX_LENGTH: usize = 12;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct ArrayMetadata {
    shape: Shape,
    dtype: DataType,
    chunks: Shape,
}

/// Stores every array as a directory holding a JSON descriptor and one file per chunk, named
/// after the chunk coordinates (`0.1`, `2.0`, ...). The store reference of an array is the path
/// of its directory.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    next_id: AtomicCell<u64>,
}

impl DirectoryStore {
    /// Create a store that allocates new arrays below `root`. The directory is created if it
    /// does not exist yet.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            fs::create_dir_all(root)
                .with_context(|| format!("failed to create directory {:?}", root))?;
        }

        if !root.is_dir() {
            bail!("path {:?} is not a directory", root);
        }

        Ok(Self {
            root: root.canonicalize()?,
            next_id: default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open an existing array directory, for example one written by an earlier run.
    pub fn open_array(path: impl AsRef<Path>) -> Result<ArrayDescriptor> {
        let path = path.as_ref();
        let file = fs::File::open(path.join(DESCRIPTOR_FILE))
            .with_context(|| format!("{:?} is not an array directory", path))?;
        let meta: ArrayMetadata = serde_json::from_reader(io::BufReader::new(file))
            .with_context(|| format!("invalid array descriptor in {:?}", path))?;

        let key = path.to_string_lossy().into_owned();
        let desc = ArrayDescriptor::new(&meta.shape, meta.dtype, &meta.chunks, StoreRef::Key(key))?;
        Ok(desc)
    }

    /// Create a new array in the given directory, which must not exist yet.
    pub fn create_array_at(
        path: impl AsRef<Path>,
        shape: &[u64],
        dtype: DataType,
        chunks: &[u64],
    ) -> Result<StoreRef> {
        let path = path.as_ref();
        fs::create_dir(path).with_context(|| format!("failed to create array {:?}", path))?;
        write_metadata(path, shape, dtype, chunks)?;

        Ok(StoreRef::Key(path.to_string_lossy().into_owned()))
    }

    fn chunk_path(store: &StoreRef, coord: &[u64]) -> Result<PathBuf, StoreError> {
        let key = store_key(store)?;
        let dir = Path::new(key);

        if !dir.is_dir() {
            return Err(StoreError::ArrayNotFound(key.to_string()));
        }

        Ok(dir.join(chunk_key(coord)))
    }
}

fn write_metadata(path: &Path, shape: &[u64], dtype: DataType, chunks: &[u64]) -> Result {
    let meta = ArrayMetadata {
        shape: shape.iter().copied().collect(),
        dtype,
        chunks: chunks.iter().copied().collect(),
    };

    let file = fs::File::create(path.join(DESCRIPTOR_FILE))?;
    serde_json::to_writer_pretty(file, &meta)?;
    Ok(())
}

impl ChunkStore for DirectoryStore {
    fn create_array(&self, shape: &[u64], dtype: DataType, chunks: &[u64]) -> Result<StoreRef> {
        let path = loop {
            let path = self
                .root
                .join(format!("array-{:04}", self.next_id.get_and_increment()));

            match fs::create_dir(&path) {
                Ok(()) => break path,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(Error::new(e).context(format!("failed to create {:?}", path)));
                }
            }
        };

        debug!("created array {:?}", path);
        write_metadata(&path, shape, dtype, chunks)?;
        Ok(StoreRef::Key(path.to_string_lossy().into_owned()))
    }

    fn read_chunk(&self, store: &StoreRef, coord: &[u64]) -> Result<Vec<u8>> {
        let path = Self::chunk_path(store, coord)?;

        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::ChunkNotFound {
                key: store.to_string(),
                coord: coord.to_vec(),
            }
            .into()),
            Err(e) => Err(StoreError::IO(e).into()),
        }
    }

    /// Chunks are written to a temporary file which is then renamed, so concurrent writers of
    /// the same chunk (a straggler and its backup) never leave a partially written file.
    fn write_chunk(&self, store: &StoreRef, coord: &[u64], data: &[u8]) -> Result {
        let path = Self::chunk_path(store, coord)?;
        let suffix: String = Alphanumeric
            .sample_iter(thread_rng())
            .take(TMP_SUFFIX_LENGTH)
            .map(char::from)
            .collect();
        let tmp = path.with_file_name(format!(".{}.{}.tmp", chunk_key(coord), suffix));

        let result = (|| -> Result<(), io::Error> {
            let mut f = OpenOptions::new().create_new(true).write(true).open(&tmp)?;
            f.write_all(data)?;
            f.sync_data()?;
            fs::rename(&tmp, &path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::IO(e).into());
        }

        Ok(())
    }
}
