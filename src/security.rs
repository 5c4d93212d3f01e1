#![forbid(unsafe_code)]

//! Startup privilege check.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start the service as root unless the operator opted in
/// (containers that only ship a root user set `TUBEVAULT_ALLOW_ROOT`).
/// Everything the external tool writes lands in the storage directory with
/// the service's ownership.
pub fn ensure_unprivileged(process: &str, allow_root: bool) -> Result<()> {
    check_uid(Uid::effective(), process, allow_root)
}

fn check_uid(uid: Uid, process: &str, allow_root: bool) -> Result<()> {
    if uid.is_root() && !allow_root {
        bail!("{process} refuses to run as root; set TUBEVAULT_ALLOW_ROOT=1 to override");
    }
    if uid.is_root() {
        tracing::warn!(process, "running as root because TUBEVAULT_ALLOW_ROOT is set");
    }
    Ok(())
}
