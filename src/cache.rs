//! Filesystem cache of genesis artifacts keyed by the two upstream revisions.
//!
//! Every artifact for a key shares the prefix `<root>/<os_ref>+<consensus_ref>`
//! and differs only by suffix. The cache assumes a single writer per key on a
//! machine; nothing here takes a lock.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{HarnessError, HarnessResult};

const PARTIAL_SUFFIX: &str = ".partial";
const PREFIX_SEPARATOR: char = '+';

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    os_ref: String,
    consensus_ref: String,
}

impl CacheKey {
    /// Builds a key, rejecting revision refs that would let two keys share a
    /// file: path separators, the `+` prefix separator, and endings that turn
    /// one artifact's name into another's.
    pub fn new(
        os_ref: impl Into<String>,
        consensus_ref: impl Into<String>,
    ) -> HarnessResult<Self> {
        let key = Self {
            os_ref: os_ref.into(),
            consensus_ref: consensus_ref.into(),
        };
        check_ref("os_ref", &key.os_ref)?;
        check_ref("consensus_ref", &key.consensus_ref)?;
        Ok(key)
    }

    pub fn os_ref(&self) -> &str {
        &self.os_ref
    }

    pub fn consensus_ref(&self) -> &str {
        &self.consensus_ref
    }

    pub fn prefix(&self) -> String {
        format!("{}{PREFIX_SEPARATOR}{}", self.os_ref, self.consensus_ref)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix())
    }
}

fn check_ref(label: &str, value: &str) -> HarnessResult<()> {
    if value.contains(['/', '\\', PREFIX_SEPARATOR]) {
        return Err(HarnessError::Config(format!(
            "revision {label} `{value}` must not contain `/`, `\\` or `{PREFIX_SEPARATOR}`"
        )));
    }
    if let Some(stem) = ArtifactKind::colliding_stems().find(|stem| value.ends_with(stem)) {
        return Err(HarnessError::Config(format!(
            "revision {label} `{value}` must not end with `{stem}`"
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Spec,
    SpecAbi,
    Keystore,
    PrivateKey,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Spec,
        ArtifactKind::SpecAbi,
        ArtifactKind::Keystore,
        ArtifactKind::PrivateKey,
    ];

    pub const fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Spec => ".json",
            ArtifactKind::SpecAbi => ".abi.json",
            ArtifactKind::Keystore => "-master-of-ceremony-key.json",
            ArtifactKind::PrivateKey => "-master-of-ceremony.key",
        }
    }

    /// Ref endings that would make `<prefix><stem>` plus one suffix equal
    /// another suffix, e.g. `.abi` followed by `.json`.
    fn colliding_stems() -> impl Iterator<Item = &'static str> {
        Self::ALL.into_iter().flat_map(|long| {
            Self::ALL.into_iter().filter_map(move |short| {
                if long == short {
                    return None;
                }
                long.suffix().strip_suffix(short.suffix())
            })
        })
    }
}

#[derive(Clone, Debug)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, kind: ArtifactKind, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}{}", key.prefix(), kind.suffix()))
    }

    pub fn contains(&self, kind: ArtifactKind, key: &CacheKey) -> bool {
        self.path_for(kind, key).is_file()
    }

    /// Returns `Ok(None)` when the artifact has never been written.
    pub fn read(&self, kind: ArtifactKind, key: &CacheKey) -> HarnessResult<Option<Vec<u8>>> {
        let path = self.path_for(kind, key);
        match fs::read(&path) {
            Ok(bytes) => {
                debug!(target: "aura::cache", path = %path.display(), len = bytes.len(), "cache hit");
                Ok(Some(bytes))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(target: "aura::cache", path = %path.display(), "cache miss");
                Ok(None)
            }
            Err(err) => Err(HarnessError::io(path, err)),
        }
    }

    /// Writes through a sibling `.partial` file and renames it into place so
    /// an interrupted write never shows up under the final name.
    pub fn write(&self, kind: ArtifactKind, key: &CacheKey, bytes: &[u8]) -> HarnessResult<PathBuf> {
        let path = self.path_for(kind, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| HarnessError::io(parent, err))?;
        }
        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        fs::write(&partial, bytes).map_err(|err| HarnessError::io(&partial, err))?;
        fs::rename(&partial, &path).map_err(|err| HarnessError::io(&path, err))?;
        debug!(target: "aura::cache", path = %path.display(), len = bytes.len(), "cache entry written");
        Ok(path)
    }
}
