use std::path::{Component, Path};

use crate::error::ValidationError;

/// Validates a single directory or file name carried by a block.
///
/// Names are resolved against the currently open directory, so they must
/// be exactly one normal path component. Rejects:
/// - Empty names
/// - `.` and `..`
/// - Separators (`/`, `\`) and NUL bytes
/// - Anything that parses as absolute or carries a Windows prefix
pub fn validate_entry_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::invalid_name(name, "empty name"));
    }
    if name == "." || name == ".." {
        return Err(ValidationError::invalid_name(
            name,
            "relative directory reference not allowed",
        ));
    }
    if name.contains(['/', '\\']) {
        return Err(ValidationError::invalid_name(
            name,
            "path separator not allowed",
        ));
    }
    if name.contains('\0') {
        return Err(ValidationError::invalid_name(name, "NUL byte not allowed"));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(ValidationError::invalid_name(
            name,
            "name must be a single path component",
        )),
    }
}

/// Validates a `/`-separated file identifier relative to the transfer root.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_relative_path(file_path: &str) -> Result<(), ValidationError> {
    if file_path.is_empty() {
        return Err(ValidationError::invalid_name(file_path, "empty path"));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(ValidationError::invalid_name(
            file_path,
            "absolute path not allowed",
        ));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(ValidationError::invalid_name(
                    file_path,
                    "parent directory traversal not allowed",
                ));
            }
            Component::Prefix(_) => {
                return Err(ValidationError::invalid_name(
                    file_path,
                    "path prefix not allowed",
                ));
            }
            Component::RootDir => {
                return Err(ValidationError::invalid_name(
                    file_path,
                    "absolute path not allowed",
                ));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
