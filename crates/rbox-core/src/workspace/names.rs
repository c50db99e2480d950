use crate::errors::WorkspaceError;

const RESERVED: [char; 7] = ['<', '>', ':', '"', '|', '?', '*'];
const MAX_NAME_LEN: usize = 255;

fn invalid(name: &str, reason: &str) -> WorkspaceError {
    WorkspaceError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Check a caller-supplied file name and return its sanitized form.
///
/// Traversal segments, separators, NUL and other control characters, and
/// absolute prefixes are rejected. Reserved characters are replaced by `_`.
pub fn sanitize_name(name: &str) -> Result<String, WorkspaceError> {
    if name.trim().is_empty() {
        return Err(invalid(name, "name is empty"));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(invalid(name, "control characters are not allowed"));
    }
    if name.starts_with('/') || name.starts_with('\\') || has_drive_prefix(name) {
        return Err(invalid(name, "absolute paths are not allowed"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid(name, "path separators are not allowed"));
    }
    if name.contains("..") {
        return Err(invalid(name, "'..' is not allowed"));
    }
    if name.starts_with('.') {
        return Err(invalid(name, "hidden file names are not allowed"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid(name, "name is too long"));
    }

    let sanitized: String = name
        .chars()
        .map(|c| if RESERVED.contains(&c) { '_' } else { c })
        .collect();
    let sanitized = sanitized.trim_end_matches([' ', '.']).to_string();
    if sanitized.is_empty() {
        return Err(invalid(name, "name is empty after sanitizing"));
    }
    Ok(sanitized)
}

/// Lower-cased extension without the dot, empty when there is none.
pub fn extension_of(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}
