//! Where pagebert keeps its databases.
//!
//! A data directory holds two redb files:
//! - `config.redb`: the document registry and persisted settings
//!   ([`crate::ConfigDb`])
//! - `items.redb`: the visual and text item collections
//!   ([`crate::item_store::ItemStore`])

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "PAGEBERT_DATA_DIR";

const XDG_PREFIX: &str = "pagebert";
const CONFIG_DB_FILE: &str = "config.redb";
const ITEMS_DB_FILE: &str = "items.redb";

/// How the data directory was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataDirSource {
    /// `--data-dir` on the command line.
    Cli,
    /// The `PAGEBERT_DATA_DIR` environment variable.
    Env,
    /// `$XDG_DATA_HOME/pagebert`.
    Xdg,
}

impl std::fmt::Display for DataDirSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DataDirSource::Cli => "cli",
            DataDirSource::Env => "env",
            DataDirSource::Xdg => "xdg",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
    source: DataDirSource,
}

impl DataDir {
    /// Pick the data directory (explicit path, then `PAGEBERT_DATA_DIR`,
    /// then XDG) and make sure it exists.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let (root, source) = match explicit {
            Some(path) => (path.to_path_buf(), DataDirSource::Cli),
            None => match std::env::var_os(DATA_DIR_ENV_VAR).filter(|v| !v.is_empty()) {
                Some(val) => (PathBuf::from(val), DataDirSource::Env),
                None => {
                    let home = xdg::BaseDirectories::with_prefix(XDG_PREFIX)
                        .get_data_home()
                        .ok_or_else(|| {
                            Error::Config("could not determine XDG data home directory".into())
                        })?;
                    (home, DataDirSource::Xdg)
                }
            },
        };

        if let Err(e) = std::fs::create_dir_all(&root) {
            tracing::warn!(path = %root.display(), error = %e, "cannot create data directory");
            return Err(Error::DataDir(root));
        }
        tracing::debug!(path = %root.display(), %source, "using data directory");
        Ok(Self { root, source })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> DataDirSource {
        self.source
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join(CONFIG_DB_FILE)
    }

    pub fn items_db(&self) -> PathBuf {
        self.root.join(ITEMS_DB_FILE)
    }
}
