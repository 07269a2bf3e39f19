//! Resolve the user's executable the way a shell would.

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use scuttle_core::errors::ProcessError;

/// Find `name` on `$PATH`, or use it directly when it contains a `/`.
pub fn resolve(name: &str) -> Result<PathBuf, ProcessError> {
    resolve_in(name, std::env::var_os("PATH").as_deref())
}

/// [`resolve`] against an explicit search path.
pub fn resolve_in(name: &str, search_path: Option<&OsStr>) -> Result<PathBuf, ProcessError> {
    if name.is_empty() {
        return Err(ProcessError::ExecutableNotFound(name.into()));
    }

    if name.contains('/') {
        let path = PathBuf::from(name);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(ProcessError::ExecutableNotFound(name.into()))
        };
    }

    let found = search_path
        .into_iter()
        .flat_map(|p| std::env::split_paths(p))
        .map(|dir| {
            // An empty PATH entry means the current directory.
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(name)
            } else {
                dir.join(name)
            }
        })
        .find(|candidate| is_executable(candidate));

    match found {
        Some(path) => {
            debug!(name, path = %path.display(), "resolved executable");
            Ok(path)
        }
        None => Err(ProcessError::ExecutableNotFound(name.into())),
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
