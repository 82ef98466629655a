use crate::error::CoordError;

/// Check that `p` is an absolute, normalized node path.
///
/// Accepted: `/`, `/a`, `/a/b-`, `/a/b/c`. Rejected: relative paths,
/// empty segments, trailing slashes.
pub(crate) fn validate(p: &str) -> Result<(), CoordError> {
    let bad = || CoordError::BadPath { path: p.to_string() };
    if !p.starts_with('/') {
        return Err(bad());
    }
    if p == "/" {
        return Ok(());
    }
    if p.ends_with('/') {
        return Err(bad());
    }
    if p[1..].split('/').any(|seg| seg.is_empty()) {
        return Err(bad());
    }
    Ok(())
}

/// Parent of a node path. The root has no parent.
pub(crate) fn parent(p: &str) -> Option<&str> {
    if p == "/" {
        return None;
    }
    match p.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&p[..i]),
        None => None,
    }
}

/// Final path segment (the node name).
pub(crate) fn last_segment(p: &str) -> &str {
    p.rsplit('/').next().unwrap_or(p)
}

/// Join a base path and a child name.
pub(crate) fn join(base: &str, child: &str) -> String {
    if base == "/" {
        format!("/{child}")
    } else {
        format!("{base}/{child}")
    }
}
