//! Open file descriptor limit.

use nix::errno::Errno;
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use tracing::{info, warn};

/// Access to the soft and hard `RLIMIT_NOFILE` values.
pub trait FileLimits {
    fn get(&self) -> nix::Result<(u64, u64)>;
    fn set(&self, soft: u64, hard: u64) -> nix::Result<()>;
}

/// Limits of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFileLimits;

impl FileLimits for SystemFileLimits {
    fn get(&self) -> nix::Result<(u64, u64)> {
        getrlimit(Resource::RLIMIT_NOFILE)
    }

    fn set(&self, soft: u64, hard: u64) -> nix::Result<()> {
        setrlimit(Resource::RLIMIT_NOFILE, soft, hard)
    }
}

/// Try to make at least `n` file descriptors available.
///
/// Raising the hard limit needs privileges, so when that fails the soft limit
/// is raised as far as the hard limit allows. Failures are only logged.
pub fn raise_file_limit(limits: &dyn FileLimits, n: u64) {
    let (soft, hard) = match limits.get() {
        Ok(current) => current,
        Err(e) => {
            warn!("unable to read file descriptor limit: {e}");
            return;
        }
    };

    if n <= soft {
        return;
    }

    if n > hard {
        match limits.set(n, n) {
            Ok(()) => {
                info!("increased file descriptor limit to {n}");
                return;
            }
            Err(Errno::EPERM) => warn!(
                "unable to increase file descriptor limit to {n}: raising the hard limit \
                 requires super-user privileges"
            ),
            Err(e) => warn!("unable to increase file descriptor limit to {n}: {e}"),
        }
    }

    let soft = n.min(hard);
    match limits.set(soft, hard) {
        Ok(()) => info!("increased file descriptor limit to {soft}"),
        Err(e) => warn!("unable to increase file descriptor limit to {soft}: {e}"),
    }
}
