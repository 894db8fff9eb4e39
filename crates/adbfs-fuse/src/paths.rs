//! Device-path manipulation.
//!
//! Device paths are always absolute, `/`-separated, and never end with a
//! slash (except the root itself). Host-side `std::path` is deliberately
//! not used here; device paths must not pick up platform behavior.

/// Joins the device root and a mount-relative name into an absolute device
/// path.
pub fn join_device_path(root: &str, name: &str) -> String {
    let mut path = String::from("/");
    for part in root.split('/').chain(name.split('/')) {
        if part.is_empty() {
            continue;
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(part);
    }
    path
}

/// The directory containing `path`. The parent of the root is the root.
pub fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => "/",
    }
}

/// The final path component. The base of the root is the root.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}
