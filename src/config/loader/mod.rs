//! `config.json` on disk. Readers take a shared lock on the file itself;
//! writers take an exclusive lock on a sibling `.lock` file because the
//! write replaces the file's inode.

use crate::config::Config;
use crate::config::credentials::apply_env_overrides;
use crate::errors::{ZapdeskError, ZapdeskResult};
use crate::utils::{atomic_write, ensure_dir, get_zapdesk_home};
use fs2::FileExt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CONFIG_FILE: &str = "config.json";

pub fn get_config_path() -> ZapdeskResult<PathBuf> {
    Ok(get_zapdesk_home()?.join(CONFIG_FILE))
}

fn resolve(config_path: Option<&Path>) -> PathBuf {
    match config_path {
        Some(path) => path.to_path_buf(),
        None => get_config_path().unwrap_or_else(|_| PathBuf::from(CONFIG_FILE)),
    }
}

fn io_error(action: &str, path: &Path, err: &io::Error) -> ZapdeskError {
    ZapdeskError::Config(format!("cannot {action} {}: {err}", path.display()))
}

/// Load, apply `ZAPDESK_*` overrides, and validate. A missing file means
/// defaults; anything unreadable, malformed or invalid is a
/// [`ZapdeskError::Config`] naming the file.
pub fn load_config(config_path: Option<&Path>) -> ZapdeskResult<Config> {
    let path = resolve(config_path);

    let mut config = match read_shared(&path)? {
        Some(content) => {
            debug!("loaded config from {}", path.display());
            serde_json::from_str(&content).map_err(|e| {
                ZapdeskError::Config(format!("invalid JSON in {}: {e}", path.display()))
            })?
        }
        None => {
            debug!("no config at {}, using defaults", path.display());
            Config::default()
        }
    };

    apply_env_overrides(&mut config);
    config.validate().map_err(|e| match e {
        ZapdeskError::Config(msg) => ZapdeskError::Config(format!("{}: {msg}", path.display())),
        other => other,
    })?;
    Ok(config)
}

fn read_shared(path: &Path) -> ZapdeskResult<Option<String>> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error("open", path, &e)),
    };
    file.lock_shared().map_err(|e| io_error("lock", path, &e))?;
    check_file_permissions(&file, path);

    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| io_error("read", path, &e))?;
    Ok(Some(content))
}

/// The file may hold the bridge secret and bootstrap password.
#[cfg(unix)]
fn check_file_permissions(file: &fs::File, path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = file.metadata() {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                "config file {} has permissions {:o}, recommend 0600",
                path.display(),
                mode & 0o777
            );
        }
    }
}

#[cfg(not(unix))]
fn check_file_permissions(_file: &fs::File, _path: &Path) {}

/// Write `config` as pretty JSON with owner-only permissions.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> ZapdeskResult<()> {
    let path = resolve(config_path);
    let parent = path
        .parent()
        .ok_or_else(|| ZapdeskError::Config(format!("{} has no parent", path.display())))?;
    ensure_dir(parent)?;

    let lock_path = path.with_extension("json.lock");
    let lock_file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&lock_path)
        .map_err(|e| io_error("create", &lock_path, &e))?;
    lock_file
        .lock_exclusive()
        .map_err(|e| io_error("lock", &lock_path, &e))?;

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ZapdeskError::Internal(e.into()))?;
    atomic_write(&path, &content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| io_error("restrict permissions on", &path, &e))?;
    }

    debug!("saved config to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests;
