use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

pub const CONFIG_FILE: &str = "server-config.json";
pub const USERS_FILE: &str = "shared-users.json";
pub const AUDIT_FILE: &str = "audit-log.json";

/// Resolve the directory holding the sharing state files.
///
/// Priority:
/// 1. explicit `dir` (the `--data-dir` flag)
/// 2. `LIBSHARE_DATA_DIR` environment variable
/// 3. Platform-specific app data dir (`~/.local/share/libshare/`, etc.)
pub fn data_dir(dir: Option<&Path>) -> Result<PathBuf> {
    let path = match dir {
        Some(d) => d.to_owned(),
        None => match std::env::var("LIBSHARE_DATA_DIR") {
            Ok(d) => PathBuf::from(d),
            Err(_) => ProjectDirs::from("", "", "libshare")
                .context("could not determine platform data directory")?
                .data_dir()
                .to_owned(),
        },
    };

    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir: {}", path.display()))?;
    Ok(path)
}
