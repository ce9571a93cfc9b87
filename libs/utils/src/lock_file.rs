//! Advisory file-based mutexes shared between pod processes.
//!
//! A lock is a file whose existence is the lock and whose contents,
//! `"pid:epoch"`, let peers decide whether the holder is still alive. The
//! volume is network-backed, so we keep create-exclusive semantics instead of
//! `flock`; a SIGKILL'd owner is survived through staleness reclamation.
//!
//! Singletons (the download worker) go through a two-phase variant: a
//! short-lived "starting" lock gates entrance to the long-lived "running"
//! lock, so two processes racing to start cannot both win.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// How long between acquisition attempts while the lock is contended.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A freshly created lock file whose payload has not landed yet is not stale;
/// give the owner this long to finish writing it.
const PAYLOAD_GRACE: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("timed out waiting for lock {path} held by {holder:?}")]
    Timeout {
        path: Utf8PathBuf,
        holder: Option<LockPayload>,
    },
    #[error("lock file I/O on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The `"pid:epoch"` record inside a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPayload {
    pub pid: u32,
    pub acquired_epoch: u64,
}

impl LockPayload {
    pub fn now() -> Self {
        Self {
            pid: std::process::id(),
            acquired_epoch: epoch_seconds(),
        }
    }

    pub fn parse(contents: &str) -> Option<Self> {
        let (pid, epoch) = contents.trim().split_once(':')?;
        Some(Self {
            pid: pid.parse().ok()?,
            acquired_epoch: epoch.parse().ok()?,
        })
    }

    pub fn serialize(&self) -> String {
        format!("{}:{}", self.pid, self.acquired_epoch)
    }

    pub fn age(&self) -> Duration {
        Duration::from_secs(epoch_seconds().saturating_sub(self.acquired_epoch))
    }

    pub fn owner_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_secs()
}

fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes existence without delivering anything. EPERM still
    // means the process exists.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Why a held lock may be taken over.
enum Staleness {
    Held(LockPayload),
    OwnerDead(LockPayload),
    Expired(LockPayload),
    Unreadable,
}

fn inspect(path: &Utf8Path, stale_ttl: Duration) -> Staleness {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Staleness::Unreadable,
    };
    match LockPayload::parse(&contents) {
        Some(payload) => {
            if !payload.owner_alive() {
                Staleness::OwnerDead(payload)
            } else if payload.age() > stale_ttl {
                Staleness::Expired(payload)
            } else {
                Staleness::Held(payload)
            }
        }
        None => Staleness::Unreadable,
    }
}

fn file_age(path: &Utf8Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// An owned lock. Dropping it releases the file, but only if we are still
/// the recorded owner: a peer that reclaimed the lock out from under a stale
/// us must not lose its own lock to our cleanup.
#[derive(Debug)]
#[must_use = "the lock is released on drop"]
pub struct LockGuard {
    path: Utf8PathBuf,
    payload: LockPayload,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Re-stamp the lock file with a fresh epoch. The singleton worker calls
    /// this as its heartbeat so peers never see it as expired.
    pub fn refresh(&mut self) -> Result<(), LockError> {
        let payload = LockPayload::now();
        std::fs::write(&self.path, payload.serialize()).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.payload = payload;
        Ok(())
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match LockPayload::parse(&contents) {
                Some(current) if current.pid == self.payload.pid => {
                    if let Err(e) = std::fs::remove_file(&self.path) {
                        warn!("failed to remove lock file {}: {e}", self.path);
                    }
                }
                Some(current) => {
                    // Non-fatal: someone reclaimed the lock from us, it is
                    // theirs to clean up now.
                    warn!(
                        "not releasing {}: now owned by pid {}",
                        self.path, current.pid
                    );
                }
                None => {
                    warn!("not releasing {}: unreadable payload", self.path);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to read lock file {} on release: {e}", self.path),
        }
    }

    pub fn release(mut self) {
        self.release_inner();
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn try_create(path: &Utf8Path) -> std::io::Result<Option<LockPayload>> {
    use std::io::Write;
    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(e),
    };
    let payload = LockPayload::now();
    file.write_all(payload.serialize().as_bytes())?;
    file.sync_all()?;
    Ok(Some(payload))
}

/// Acquire the lock at `path`, waiting up to `timeout`.
///
/// A lock whose owner no longer exists, or whose age exceeds `stale_ttl`, is
/// force-removed with a warning and the acquisition retried immediately.
pub fn acquire(
    path: &Utf8Path,
    timeout: Duration,
    stale_ttl: Duration,
) -> Result<LockGuard, LockError> {
    let deadline = std::time::Instant::now() + timeout;
    let mut last_holder = None;
    loop {
        match try_create(path) {
            Ok(Some(payload)) => {
                debug!("acquired lock {path}");
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                    payload,
                    released: false,
                });
            }
            Ok(None) => {}
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        match inspect(path, stale_ttl) {
            Staleness::Held(payload) => {
                last_holder = Some(payload);
            }
            Staleness::OwnerDead(payload) => {
                warn!(
                    "reclaiming lock {path}: owner pid {} no longer exists",
                    payload.pid
                );
                let _ = std::fs::remove_file(path);
                continue;
            }
            Staleness::Expired(payload) => {
                warn!(
                    "reclaiming lock {path}: held by pid {} for {:?} (ttl {:?})",
                    payload.pid,
                    payload.age(),
                    stale_ttl
                );
                let _ = std::fs::remove_file(path);
                continue;
            }
            Staleness::Unreadable => {
                // Either the file vanished between create and inspect, or the
                // owner has not finished writing its payload. Only reclaim
                // once the file is old enough that no live writer can explain
                // it.
                if file_age(path).is_some_and(|age| age > PAYLOAD_GRACE) {
                    warn!("reclaiming lock {path}: unreadable payload");
                    let _ = std::fs::remove_file(path);
                    continue;
                }
            }
        }

        if std::time::Instant::now() >= deadline {
            return Err(LockError::Timeout {
                path: path.to_path_buf(),
                holder: last_holder,
            });
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
}

/// Outcome of a two-phase singleton start.
pub enum SingletonStart {
    /// We are the singleton now; keep the guard alive (and refreshed) for as
    /// long as the role is held.
    Acquired(LockGuard),
    /// A live peer (possibly ourselves) already holds the running lock.
    AlreadyRunning { owner_pid: u32 },
}

/// Two-phase singleton acquisition: a short-lived "starting" lock serializes
/// the decision, the long-lived "running" lock marks the role.
///
/// Stale running locks (dead owner or over `running_ttl`) are reclaimed while
/// the starting lock is held, so at most one contender wins.
pub fn acquire_singleton(
    starting_path: &Utf8Path,
    running_path: &Utf8Path,
    starting_timeout: Duration,
    running_ttl: Duration,
) -> Result<SingletonStart, LockError> {
    // The starting lock is only ever held for the duration of this function;
    // its TTL can be as tight as its timeout.
    let starting = acquire(starting_path, starting_timeout, starting_timeout)?;

    let result = match inspect(running_path, running_ttl) {
        Staleness::Held(payload) => {
            info!(
                "singleton {running_path} already running as pid {}",
                payload.pid
            );
            Ok(SingletonStart::AlreadyRunning {
                owner_pid: payload.pid,
            })
        }
        state => {
            match state {
                Staleness::OwnerDead(payload) => {
                    warn!(
                        "singleton {running_path}: previous owner pid {} is gone, taking over",
                        payload.pid
                    );
                    let _ = std::fs::remove_file(running_path);
                }
                Staleness::Expired(payload) => {
                    warn!(
                        "singleton {running_path}: owner pid {} stopped heartbeating, taking over",
                        payload.pid
                    );
                    let _ = std::fs::remove_file(running_path);
                }
                Staleness::Unreadable => {
                    let _ = std::fs::remove_file(running_path);
                }
                Staleness::Held(_) => unreachable!("handled above"),
            }
            // Zero timeout: under the starting lock nobody else can contend.
            acquire(running_path, Duration::ZERO, running_ttl).map(SingletonStart::Acquired)
        }
    };

    starting.release();
    result
}
