use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt cache entry: {0}")]
    CorruptCache(String),
    #[error("genesis build failed: {0}")]
    BuildFailure(String),
    #[error("node launch failed: {0}")]
    LaunchFailure(String),
    #[error("node at {endpoint} not ready after {attempts} probes in {waited:?}")]
    NotReady {
        endpoint: String,
        attempts: u32,
        waited: Duration,
    },
    #[error("directory {} already exists", .0.display())]
    DirectoryExists(PathBuf),
    #[error("configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        HarnessError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
