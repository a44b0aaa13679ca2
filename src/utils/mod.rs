pub mod task_tracker;

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

pub fn get_zapdesk_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("ZAPDESK_HOME") {
        return Ok(PathBuf::from(home));
    }
    Ok(dirs::home_dir()
        .context("Could not determine home directory")?
        .join(".zapdesk"))
}

/// Write content atomically via tempfile + rename.
///
/// The file is either fully written or untouched.
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().context("Path has no parent directory")?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(content.as_bytes())
        .with_context(|| "Failed to write to temp file")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to atomically rename to {}", path.display()))?;
    Ok(())
}

/// Normalize a contact identity reported by the transport.
///
/// Strips a leading `+`, a WhatsApp JID suffix (`@s.whatsapp.net`,
/// `@c.us`) and control characters, so `+55 11...@c.us` and `5511...`
/// map to the same contact.
pub fn normalize_contact_id(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('+');
    let user = trimmed.split_once('@').map_or(trimmed, |(user, _)| user);
    // device suffix, e.g. "5511999991234:12"
    let user = user.split_once(':').map_or(user, |(user, _)| user);
    user.chars()
        .filter(|c| !c.is_control() && !c.is_whitespace())
        .collect()
}

/// Exponential backoff delay for reconnection attempts.
///
/// `base * 2^attempt`, capped at `max`, plus up to 25% jitter to avoid
/// thundering herd.
pub fn exponential_backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2.0_f64.powi(attempt.min(63) as i32);
    let delay = base.as_secs_f64() * factor;
    let capped = delay.min(max.as_secs_f64());
    let jitter = capped * 0.25 * fastrand::f64();
    Duration::from_secs_f64(capped + jitter)
}
