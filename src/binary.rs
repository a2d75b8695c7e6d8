//! Checks on a provisioned downloader binary before it is launched

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Make sure `path` exists and, on Unix, carries execute permission.
///
/// Bare command names (no path separator) are left to `PATH` lookup at spawn time.
pub fn ensure_executable(path: &Path) -> Result<()> {
    if path.components().count() <= 1 && !path.is_absolute() {
        return Ok(());
    }

    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Binary not found: {}", path.display()))?;
    if !metadata.is_file() {
        bail!("Binary is not a file: {}", path.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut perms = metadata.permissions();
        if perms.mode() & 0o111 != 0o111 {
            perms.set_mode(perms.mode() | 0o755);
            std::fs::set_permissions(path, perms)
                .with_context(|| format!("Failed to make {} executable", path.display()))?;
            tracing::debug!(path = %path.display(), "Added execute permission");
        }
    }

    Ok(())
}
