//! Configuration for opening a patch store.

use std::path::{Path, PathBuf};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::store::{
    DEFAULT_WATCH_CAPACITY, StorageError,
    fs::{FsPatchStore, FsStore},
};

/// Errors when loading a [`Config`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse {}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Store configuration.
///
/// Usually loaded from a TOML file with [`Self::load`]. The [`Default`] config keeps the
/// database in memory, which is what tests want.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path of the redb database file.
    ///
    /// If `None`, the database lives in memory and is gone once the store is dropped.
    pub path: Option<PathBuf>,
    /// Capacity of the channels handed out by
    /// [`PatchStore::subscribe`](crate::PatchStore::subscribe).
    pub watch_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            watch_capacity: DEFAULT_WATCH_CAPACITY,
        }
    }
}

impl Config {
    /// Loads the config from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        let config: Config = toml::from_str(&s).context(ParseSnafu { path })?;
        Ok(config)
    }

    /// Opens the configured database and builds a patch store on it.
    pub fn open_store(&self) -> Result<FsPatchStore, StorageError> {
        let db = match &self.path {
            Some(path) => FsStore::persistent(path)?,
            None => FsStore::in_memory()?,
        };
        Ok(FsPatchStore::from_db(db, self.watch_capacity))
    }
}
