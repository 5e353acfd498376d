//! Filesystem reshaping, step 3 of `contain.rs`'s `ChildSteps` (spec.md
//! §4.F): chroot pivot + RO/RW remount + ordered bind mounts (source RO) +
//! ordered tmpfs mounts.
//!
//! Adapted from this crate's own `pivot_root`/`setup_mount` helpers, which
//! used to serve a single overlay-plus-base-mounts scheme; generalized here
//! to the spec's arbitrary bind/tmpfs lists instead of a fixed mount table.

use std::fs::create_dir_all;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::fchdir;

use crate::error::Error;

fn ignore_kind(result: std::io::Result<()>, kind: ErrorKind) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == kind => Ok(()),
        other => other,
    }
}

/// Bind-mounts `src` read-only at the same path under `chroot`.
fn bind_mount_ro(chroot: &Path, src: &Path) -> Result<(), Error> {
    let target = chroot.join(src.strip_prefix("/").unwrap_or(src));
    ignore_kind(create_dir_all(&target), ErrorKind::AlreadyExists)?;
    mount(Some(src), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)?;
    mount(
        Some(src),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )?;
    Ok(())
}

/// Mounts a fresh, empty tmpfs at `path` under `chroot`.
fn tmpfs_mount(chroot: &Path, path: &Path) -> Result<(), Error> {
    let target = chroot.join(path.strip_prefix("/").unwrap_or(path));
    ignore_kind(create_dir_all(&target), ErrorKind::AlreadyExists)?;
    mount(
        Some("tmpfs"),
        &target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )?;
    Ok(())
}

fn remount_private_root(chroot: &Path) -> Result<(), Error> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    mount(
        Some(chroot),
        chroot,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    Ok(())
}

/// Pivots the mount namespace's root into `chroot`, then detaches the
/// original root so nothing outside the jail remains reachable by path.
fn pivot_root(chroot: &Path) -> Result<(), Error> {
    let new_root = open(
        chroot,
        OFlag::O_DIRECTORY | OFlag::O_RDONLY,
        nix::sys::stat::Mode::empty(),
    )?;
    nix::unistd::pivot_root(chroot, chroot)?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    umount2("/", MntFlags::MNT_DETACH)?;
    Ok(fchdir(new_root)?)
}

fn remount_root_ro(chroot: &Path) -> Result<(), Error> {
    mount(
        Some(chroot),
        chroot,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )?;
    Ok(())
}

/// Reshapes the child's filesystem view: private-bind the chroot, lay down
/// every bind and tmpfs mount, optionally remount the root read-only, then
/// pivot into it. Order matches spec.md §4.F: mounts happen before the
/// pivot so their targets still resolve against the old root's path space.
pub fn setup(
    chroot: &Path,
    root_rw: bool,
    binds: &[PathBuf],
    tmpfs_paths: &[PathBuf],
) -> Result<(), Error> {
    remount_private_root(chroot)?;
    for src in binds {
        bind_mount_ro(chroot, src)?;
    }
    for path in tmpfs_paths {
        tmpfs_mount(chroot, path)?;
    }
    if !root_rw {
        remount_root_ro(chroot)?;
    }
    pivot_root(chroot)
}
