//! Download destination routing.
//!
//! Many catalog entries can share one canonical remote artifact while naming
//! different local paths. The resolver collapses them onto a single physical
//! destination under the local `models` tree, and reports whether the
//! requesting path still needs a symlink back to that destination.
//!
//! This routing is pure: no I/O, deterministic for the same inputs.

use camino::{Utf8Path, Utf8PathBuf};

use crate::catalog::{split_at_models_marker, strip_bucket_prefix};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    /// The physical path bytes are written to.
    pub destination: Utf8PathBuf,
    /// True when the requested local path differs from the destination and
    /// must become a symlink to it after the download.
    pub needs_symlink: bool,
}

fn normalize(path: &Utf8Path) -> String {
    let mut out = String::with_capacity(path.as_str().len());
    let mut prev_slash = false;
    for c in path.as_str().chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// The longest prefix of `local_path` ending at a `.../models` component;
/// when the path has no such component, its parent directory.
fn local_models_prefix(local_path: &Utf8Path) -> Utf8PathBuf {
    match split_at_models_marker(local_path.as_str()) {
        Some((prefix, _)) => Utf8PathBuf::from(prefix),
        None => local_path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("/")),
    }
}

/// The remote path's suffix after its last `models/` component; the whole
/// normalized path when there is none.
fn remote_models_suffix(remote_path: &str) -> &str {
    match split_at_models_marker(remote_path) {
        Some((_, suffix)) => suffix,
        None => remote_path,
    }
}

/// Decide where `remote_path` lands locally for a consumer at `local_path`.
pub fn resolve_destination(local_path: &Utf8Path, remote_path: &str) -> ResolvedDestination {
    let prefix = local_models_prefix(local_path);
    let normalized_remote = strip_bucket_prefix(remote_path);
    let suffix = remote_models_suffix(normalized_remote);
    let destination = prefix.join(suffix);
    let needs_symlink = normalize(local_path) != normalize(&destination);
    ResolvedDestination {
        destination,
        needs_symlink,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_resolves_to_itself() {
        let resolved = resolve_destination(
            Utf8Path::new("/vol/ComfyUI/models/checkpoints/sd.safetensors"),
            "models/checkpoints/sd.safetensors",
        );
        assert_eq!(
            resolved.destination,
            Utf8Path::new("/vol/ComfyUI/models/checkpoints/sd.safetensors")
        );
        assert!(!resolved.needs_symlink);
    }

    #[test]
    fn divergent_local_path_needs_symlink() {
        let resolved = resolve_destination(
            Utf8Path::new("/vol/ComfyUI/models/loras/sd.safetensors"),
            "models/checkpoints/sd.safetensors",
        );
        assert_eq!(
            resolved.destination,
            Utf8Path::new("/vol/ComfyUI/models/checkpoints/sd.safetensors")
        );
        assert!(resolved.needs_symlink);
    }

    #[test]
    fn bucket_scheme_is_stripped() {
        let resolved = resolve_destination(
            Utf8Path::new("/vol/ComfyUI/models/checkpoints/sd.safetensors"),
            "s3://model-artifacts/models/checkpoints/sd.safetensors",
        );
        assert_eq!(
            resolved.destination,
            Utf8Path::new("/vol/ComfyUI/models/checkpoints/sd.safetensors")
        );
        assert!(!resolved.needs_symlink);
    }

    #[test]
    fn leading_slash_is_stripped() {
        let resolved = resolve_destination(
            Utf8Path::new("/vol/ComfyUI/models/checkpoints/sd.safetensors"),
            "/models/checkpoints/sd.safetensors",
        );
        assert!(!resolved.needs_symlink);
    }

    #[test]
    fn local_path_without_marker_falls_back_to_dirname() {
        let resolved = resolve_destination(
            Utf8Path::new("/data/downloads/sd.safetensors"),
            "models/checkpoints/sd.safetensors",
        );
        assert_eq!(
            resolved.destination,
            Utf8Path::new("/data/downloads/checkpoints/sd.safetensors")
        );
        assert!(resolved.needs_symlink);
    }

    #[test]
    fn remote_without_marker_uses_whole_path() {
        let resolved = resolve_destination(
            Utf8Path::new("/vol/ComfyUI/models/checkpoints/sd.safetensors"),
            "artifacts/sd.safetensors",
        );
        assert_eq!(
            resolved.destination,
            Utf8Path::new("/vol/ComfyUI/models/artifacts/sd.safetensors")
        );
        assert!(resolved.needs_symlink);
    }

    #[test]
    fn resolver_is_deterministic() {
        let local = Utf8Path::new("/vol/ComfyUI/models/loras/x.safetensors");
        let remote = "models/checkpoints/x.safetensors";
        let a = resolve_destination(local, remote);
        let b = resolve_destination(local, remote);
        assert_eq!(a, b);
    }

    #[test]
    fn needs_symlink_iff_destination_differs() {
        // same path spelled with a duplicate slash still counts as equal
        let resolved = resolve_destination(
            Utf8Path::new("/vol/ComfyUI/models//checkpoints/sd.safetensors"),
            "models/checkpoints/sd.safetensors",
        );
        assert!(!resolved.needs_symlink);
    }
}
