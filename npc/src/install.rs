//! Copies the running binary to the platform binary directory on `install`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};

/// Install locations, most preferred first.
pub fn binary_targets() -> Vec<PathBuf> {
    if cfg!(windows) {
        let program_files =
            std::env::var_os("ProgramFiles").unwrap_or_else(|| "C:\\Program Files".into());
        vec![PathBuf::from(program_files).join("npc").join("npc.exe")]
    } else {
        vec![
            PathBuf::from("/usr/bin/npc"),
            PathBuf::from("/usr/local/bin/npc"),
        ]
    }
}

fn copy_executable(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    // Unlink first so a running copy of the old binary is not overwritten in place.
    match fs::remove_file(target) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
        _ => {}
    }
    fs::copy(source, target)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Copy `current` to the first writable target and return the path the
/// service should execute. Falls back to `current` when every copy fails.
pub fn install_binary(current: &Path, targets: &[PathBuf]) -> PathBuf {
    for target in targets {
        if target == current {
            return target.clone();
        }
        match copy_executable(current, target) {
            Ok(()) => {
                info!("installed {} to {}", current.display(), target.display());
                return target.clone();
            }
            Err(err) => warn!("cannot install binary to {}: {}", target.display(), err),
        }
    }
    warn!(
        "binary not installed, the service will run {}",
        current.display()
    );
    current.to_path_buf()
}
