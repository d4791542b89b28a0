//! Mount point discovery and the single-instance lock file guarding it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::ShellError;
use crate::util::expand_tilde;

const LOCK_FILE_NAME: &str = "para.pid";

/// The first existing directory from `./<host-tool>.d/plugins`, then
/// `~/.<host-tool>.d/plugins`.
pub fn discover_mount_point(host_tool: &str) -> Result<PathBuf, ShellError> {
    let cwd = std::env::current_dir().map_err(ShellError::Io)?;
    discover_mount_point_under(&cwd, host_tool)
}

fn discover_mount_point_under(base: &Path, host_tool: &str) -> Result<PathBuf, ShellError> {
    let local = base.join(format!("{host_tool}.d/plugins"));
    let user = expand_tilde(&format!("~/.{host_tool}.d/plugins"));

    for candidate in [local, user] {
        match fs::metadata(&candidate) {
            Ok(meta) if meta.is_dir() => return Ok(candidate),
            Ok(_) => return Err(ShellError::NotADirectory(candidate)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(ShellError::Io(e)),
        }
    }

    Err(ShellError::NoMountPoint)
}

/// A held lock on `<mount-parent>/para.pid`. Dropping without calling
/// [`LockFile::remove`] leaves the file behind; callers must remove it
/// explicitly on clean shutdown.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock for `mount_point`. If a stale lock is found (its PID
    /// is no longer alive), tear it down once and retry; a second failure
    /// is fatal per the at-most-one-retry startup contract.
    pub fn acquire(mount_point: &Path) -> Result<Self, ShellError> {
        let parent = mount_point.parent().unwrap_or(mount_point).to_owned();
        let path = parent.join(LOCK_FILE_NAME);

        if create_exclusive(&path).is_ok() {
            return Ok(Self { path });
        }

        if let Some(pid) = read_pid(&path) {
            if process_is_alive(pid) {
                return Err(ShellError::Busy(pid));
            }
        }

        let _ = fs::remove_file(&path);
        let _ = unmount(mount_point);

        create_exclusive(&path).map_err(ShellError::Io)?;
        Ok(Self { path })
    }

    pub fn remove(self) -> Result<(), ShellError> {
        fs::remove_file(&self.path).map_err(ShellError::Io)
    }
}

fn create_exclusive(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())
}

fn read_pid(path: &Path) -> Option<i32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
    false
}

/// Best-effort unmount of a (possibly stale) mount point, shelling out since
/// there is no live `BackgroundSession` for a mount this process didn't create.
#[cfg(target_os = "linux")]
pub fn unmount(path: &Path) -> io::Result<()> {
    std::process::Command::new("fusermount").arg("-u").arg(path).status().map(|_| ())
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn unmount(path: &Path) -> io::Result<()> {
    std::process::Command::new("umount").arg(path).status().map(|_| ())
}

#[cfg(not(unix))]
pub fn unmount(_path: &Path) -> io::Result<()> {
    Ok(())
}
