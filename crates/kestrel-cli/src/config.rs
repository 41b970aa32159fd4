//! Binary configuration: a TOML file layered under `KESTREL_*` environment
//! variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use kestrel_query::QueryConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub db_path: PathBuf,
  pub relay:   QueryConfig,
}

impl Default for Settings {
  fn default() -> Self {
    Self { db_path: PathBuf::from("./kestrel.db"), relay: QueryConfig::default() }
  }
}

impl Settings {
  /// Read `path` if it exists, then apply overrides such as
  /// `KESTREL_RELAY__NUM_WORKERS=8`.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("KESTREL")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .context("failed to read config file")?;

    let mut settings: Settings = settings
      .try_deserialize()
      .context("failed to deserialise settings")?;
    settings.db_path = expand_tilde(&settings.db_path);
    Ok(settings)
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
