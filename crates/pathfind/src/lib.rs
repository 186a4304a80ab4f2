//! Program and path resolution for the launcher: search-path lookup backed
//! by a concurrent cache, and lexical normalization of caller-supplied paths
//! into the native form the loader expects.

use dashmap::DashMap;
use rayon::prelude::*;
use std::{
    borrow::Cow,
    env,
    path::{Component, Path, PathBuf},
    sync::LazyLock,
};

/// Errors resolving a program name.
#[derive(Debug)]
pub enum Error {
    /// The name exists neither as a path nor anywhere on the search path.
    NotFound(String),
}
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(e) => write!(f, "Could not find {e} in path"),
        }
    }
}
impl std::error::Error for Error {}

/// The search path, read from **PATH** once per process. Entries that do not
/// exist are dropped up front so lookups never stat them.
pub static PATH: LazyLock<Vec<PathBuf>> = LazyLock::new(|| {
    let path = env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into());
    path.split(':')
        .map(PathBuf::from)
        .filter(|root| root.exists())
        .collect::<Vec<_>>()
});

/// Resolved names. Lookups repeat for every launch otherwise.
static CACHE: LazyLock<DashMap<String, PathBuf, ahash::RandomState>> =
    LazyLock::new(DashMap::default);

/// Resolve a program name to a launchable path.
///
/// A name that already names an existing path is returned as given; a bare
/// name is searched for across [`PATH`]. Results are cached for the life of
/// the process.
pub fn resolve<'a>(program: impl Into<Cow<'a, str>>) -> Result<PathBuf, Error> {
    let program = program.into();

    if let Some(hit) = CACHE.get(program.as_ref()) {
        return Ok(hit.value().clone());
    }

    let resolved = if Path::new(program.as_ref()).exists() {
        PathBuf::from(program.as_ref())
    } else {
        PATH.par_iter()
            .find_map_any(|root: &PathBuf| {
                let candidate = root.join(program.as_ref());
                candidate.exists().then_some(candidate)
            })
            .ok_or_else(|| Error::NotFound(program.clone().into_owned()))?
    };

    let _ = CACHE.insert(program.into_owned(), resolved.clone());
    Ok(resolved)
}

/// Merge `raw` onto an optional base directory and fold it into the native
/// form, collapsing `.` and `..` lexically. An absolute `raw` ignores the
/// base. No filesystem access takes place; existence is the caller's
/// problem.
pub fn merge(base: Option<&Path>, raw: &str) -> PathBuf {
    let raw = Path::new(raw);
    let mut merged = if raw.is_absolute() {
        PathBuf::new()
    } else {
        base.map(Path::to_path_buf).unwrap_or_default()
    };

    for component in raw.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !merged.pop() {
                    merged.push("..");
                }
            }
            other => merged.push(other.as_os_str()),
        }
    }
    merged
}
