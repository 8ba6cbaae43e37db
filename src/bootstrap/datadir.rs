//! Data directory resolution and preparation
//!
//! The data directory is resolved once, created owner-only and made the
//! process working directory. Changing the working directory is process-wide
//! state, so it happens here and nowhere else; every other component receives
//! the resolved [`DataDir`] and builds absolute paths from it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::{Error, Result, SERVER_SUBDIR, SYSTEM_DATA_DIR, USER_DATA_DIR};

/// Whether the process runs with elevated privilege
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    /// Effective uid 0
    Root,
    /// Any other user
    User,
}

impl Privilege {
    /// Privilege of the current process
    pub fn current() -> Self {
        #[cfg(unix)]
        {
            if nix::unistd::geteuid().is_root() {
                return Privilege::Root;
            }
        }
        Privilege::User
    }
}

/// The resolved, absolute working directory of the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDir(PathBuf);

impl DataDir {
    /// Wrap an already-absolute directory
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The directory itself
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// A path inside the data directory
    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.0.join(rel)
    }
}

/// Default data directories selected by privilege
#[derive(Clone, Debug)]
pub struct DataDirDefaults {
    /// Used when running as root
    pub system: PathBuf,
    /// Used otherwise; may reference `${HOME}`
    pub user: PathBuf,
}

impl Default for DataDirDefaults {
    fn default() -> Self {
        Self {
            system: PathBuf::from(SYSTEM_DATA_DIR),
            user: PathBuf::from(USER_DATA_DIR),
        }
    }
}

/// Resolve the configured directory to an absolute server directory
///
/// An empty configuration selects `/var/lib/lattice` for root and
/// `${HOME}/.lattice` otherwise. `${HOME}` and a leading `~` are expanded,
/// the fixed `server` segment is appended, and a relative result is anchored
/// at `cwd`.
pub fn resolve_data_dir(
    configured: Option<&Path>,
    privilege: Privilege,
    defaults: &DataDirDefaults,
    home: Option<&Path>,
    cwd: &Path,
) -> Result<PathBuf> {
    let base = match configured {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => match privilege {
            Privilege::Root => defaults.system.as_path(),
            Privilege::User => defaults.user.as_path(),
        },
    };
    let base = base.to_string_lossy();

    let expanded = expand_home(&base, home)?;
    let dir = expanded.join(SERVER_SUBDIR);

    if dir.is_absolute() {
        Ok(dir)
    } else {
        Ok(cwd.join(dir))
    }
}

fn expand_home(path: &str, home: Option<&Path>) -> Result<PathBuf> {
    let needs_home = path.contains("${HOME}") || path == "~" || path.starts_with("~/");
    if !needs_home {
        return Ok(PathBuf::from(path));
    }

    let home = home
        .ok_or_else(|| Error::data_dir(path, "resolve", "could not determine home directory"))?;
    let home = home.to_string_lossy();

    let expanded = if let Some(rest) = path.strip_prefix('~') {
        format!("{}{}", home, rest)
    } else {
        path.replace("${HOME}", &home)
    };
    Ok(PathBuf::from(expanded))
}

/// Resolve, create (mode 0700) and chdir into the data directory
///
/// Every failure is fatal: directory problems do not heal by retrying.
pub fn prepare(
    configured: Option<&Path>,
    privilege: Privilege,
    defaults: &DataDirDefaults,
) -> Result<DataDir> {
    let cwd = std::env::current_dir()
        .map_err(|e| Error::data_dir(".", "resolve", format!("current directory: {}", e)))?;
    let home = dirs::home_dir();
    let dir = resolve_data_dir(configured, privilege, defaults, home.as_deref(), &cwd)?;

    create_private_dir(&dir)
        .map_err(|e| Error::data_dir(&dir, "mkdir", format!("can not mkdir: {}", e)))?;

    std::env::set_current_dir(&dir)
        .map_err(|e| Error::data_dir(&dir, "chdir", format!("can not chdir: {}", e)))?;

    info!(path = %dir.display(), "Using data directory");
    Ok(DataDir(dir))
}

/// Create a directory tree whose newly created components are owner-only
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

#[cfg(test)]
static CWD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Serialize tests that change the process working directory
///
/// The working directory is reset to the crate root first; a previous test
/// may have left it inside a temp dir that no longer exists.
#[cfg(test)]
pub(crate) fn lock_cwd() -> std::sync::MutexGuard<'static, ()> {
    let guard = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let _ = std::env::set_current_dir(env!("CARGO_MANIFEST_DIR"));
    guard
}
