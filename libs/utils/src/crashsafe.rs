//! Atomic replacement of files that concurrent peers read without locks.
//!
//! Every shared mutable file on the pod volume is rewritten through
//! [`overwrite`]: write a temporary sibling, fsync it, rename over the final
//! path, fsync the parent directory. A reader never observes a torn file,
//! only the previous or the next version.

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

pub const TEMP_FILE_SUFFIX: &str = "___temp";

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(
    original_path: impl AsRef<Utf8Path>,
    suffix: &str,
) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => format!("{extension}.{suffix}"),
        None => suffix.to_string(),
    };
    original_path.as_ref().with_extension(new_extension)
}

fn fsync_parent(path: &Utf8Path) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("/"));
    std::fs::File::open(parent)?.sync_all()
}

/// Replace the contents of `final_path` atomically.
///
/// The rename is the commit point: a crash before it leaves the previous
/// version intact, a crash after it leaves the new one.
pub fn overwrite(final_path: &Utf8Path, content: &[u8]) -> std::io::Result<()> {
    let tmp_path = path_with_suffix_extension(final_path, TEMP_FILE_SUFFIX);
    {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp_path, final_path) {
        // the tmp file is an orphan now, don't leave it behind
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }
    fsync_parent(final_path)
}

/// Serialize `value` to pretty JSON and [`overwrite`] the target path.
///
/// The serialized bytes are parsed back before the rename: a value that
/// cannot round-trip must never become the on-disk state peers read.
pub fn overwrite_json<T: Serialize>(final_path: &Utf8Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    serde_json::from_slice::<serde_json::Value>(&bytes)?;
    overwrite(final_path, &bytes)?;
    Ok(())
}

/// Load a JSON file, falling back to `default` when the file is absent or
/// unparseable.
///
/// Peers write these files atomically, but a torn or hand-edited file must
/// not wedge the whole subsystem: reinitialize and warn instead.
pub fn load_json_or_default<T: DeserializeOwned>(path: &Utf8Path, default: T) -> T {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return default,
        Err(e) => {
            warn!("could not read {path}: {e}, reinitializing");
            return default;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!("malformed JSON in {path}: {e}, reinitializing");
            default
        }
    }
}

/// Create a directory and all of its parents, fsyncing the last parent so
/// the new entry survives a crash.
pub fn create_dir_all(path: &Utf8Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    fsync_parent(path)
}
