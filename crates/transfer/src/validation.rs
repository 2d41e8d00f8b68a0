use std::path::{Component, Path};

use crate::TransferError;

/// Name used when the sender did not suggest one, or suggested an unusable one.
pub const FALLBACK_FILE_NAME: &str = "received.bin";

/// Validates that a suggested file name is a single plain path component.
///
/// Rejects:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Any directory separator, including nested relative paths
/// - `.` and `..`
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }
    if name.contains(['/', '\\']) {
        return Err(TransferError::InvalidName(format!(
            "directory separator not allowed: {name}"
        )));
    }
    if name.contains('\0') {
        return Err(TransferError::InvalidName("NUL byte not allowed".into()));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::CurDir | Component::ParentDir), _) => Err(TransferError::InvalidName(
            format!("relative directory not allowed: {name}"),
        )),
        (Some(Component::Prefix(_) | Component::RootDir), _) => Err(TransferError::InvalidName(
            format!("absolute path not allowed: {name}"),
        )),
        _ => Err(TransferError::InvalidName(format!("not a plain name: {name}"))),
    }
}

/// Reduces a sender-suggested name to something safe to create in a
/// download directory.
///
/// Only the last path component is kept; anything that still fails
/// [`validate_file_name`] falls back to [`FALLBACK_FILE_NAME`].
pub fn safe_file_name(suggested: Option<&str>) -> String {
    let Some(suggested) = suggested else {
        return FALLBACK_FILE_NAME.to_string();
    };
    let last = suggested
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or_default()
        .trim();
    match validate_file_name(last) {
        Ok(()) => last.to_string(),
        Err(_) => FALLBACK_FILE_NAME.to_string(),
    }
}
