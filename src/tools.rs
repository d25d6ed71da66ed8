use anyhow::{bail, Error};
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat;
use nix::unistd;

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;

lazy_static! {
    static ref HOSTNAME: String = read_hostname();
}

fn read_hostname() -> String {
    let mut buf = [0u8; 256];
    match unistd::gethostname(&mut buf) {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => String::from("localhost"),
    }
}

/// Short hostname of this machine, cached for the process lifetime.
pub fn hostname() -> &'static str {
    &HOSTNAME
}

/// Create a uniquely named temporary file next to `path`.
///
/// Note: we use mkstemp here, because this works with different
/// processes and threads.
pub fn make_tempfile<P: AsRef<Path>>(path: P, mode: stat::Mode) -> Result<(File, PathBuf), Error> {
    let path = path.as_ref();

    let mut template = path.as_os_str().to_owned();
    template.push(".tmp_XXXXXX");
    let template = PathBuf::from(template);

    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed - {}", template, err),
    };

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(&tmp_path);
        bail!("fchmod {:?} failed - {}", tmp_path, err);
    }

    let file = unsafe { File::from_raw_fd(fd) };

    Ok((file, tmp_path))
}

/// Set the modification time of `path` (atime is set to the same value).
pub fn set_file_mtime<P: AsRef<Path>>(path: P, mtime: libc::time_t) -> Result<(), Error> {
    use nix::sys::time::{TimeVal, TimeValLike};

    let path = path.as_ref();
    let tv = TimeVal::seconds(mtime as i64);
    if let Err(err) = stat::utimes(path, &tv, &tv) {
        bail!("utimes {:?} failed - {}", path, err);
    }
    Ok(())
}

/// Exclusive lock over a directory, implemented as a ``flock``'ed
/// lock file inside it. Released when dropped.
pub struct DirLock {
    _file: File,
}

/// Acquire an exclusive lock file in `dir`, waiting up to `timeout` seconds.
pub fn lock_dir<P: AsRef<Path>>(dir: P, lock_name: &str, timeout: usize) -> Result<DirLock, Error> {
    let path = dir.as_ref().join(lock_name);

    let lockfile = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(err) => bail!("unable to open lock {:?} - {}", path, err),
    };

    let fd = lockfile.as_raw_fd();

    let now = std::time::SystemTime::now();
    loop {
        match flock(fd, FlockArg::LockExclusiveNonblock) {
            Ok(_) => break,
            Err(_) => { /* still locked by someone else */ }
        }

        match now.elapsed() {
            Ok(elapsed) => {
                if elapsed.as_secs() >= (timeout as u64) {
                    bail!("unable to acquire lock {:?} - got timeout", path);
                }
            }
            Err(err) => {
                bail!("unable to acquire lock {:?} - clock problems - {}", path, err);
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    Ok(DirLock { _file: lockfile })
}
