//! `/`-separated path handling.
//!
//! Paths are relative to the tree root. Leading and trailing slashes and
//! repeated separators are tolerated; `.` and `..` are not.

use crate::errors::TreeError;

/// Split a path into its components. The root is the empty list.
pub fn split_path(path: &str) -> Result<Vec<&str>, TreeError> {
    let mut out = Vec::new();
    for component in path.split('/') {
        match component {
            "" => continue,
            "." | ".." => return Err(TreeError::InvalidPath(path.to_string())),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Split a path into parent components and final name.
pub fn parent_and_name(path: &str) -> Result<(Vec<&str>, &str), TreeError> {
    let mut components = split_path(path)?;
    let name = components
        .pop()
        .ok_or_else(|| TreeError::InvalidPath(format!("'{}' names the root", path)))?;
    Ok((components, name))
}

/// Join a canonical parent path and a name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}
