use crate::error::{IngestError, IngestResult};
use crate::upload::types::{Metadata, DEFAULT_ALLOWED_TYPES, META_SUFFIX, SUPPORTED_TYPES};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;

/// Characters object stores reject or mangle in keys
const UNSAFE_NAME_CHARS: &[char] = &[
    '\\', '#', '%', '"', '\'', '|', '<', '>', '{', '}', '`', '^', '[', ']', '~',
];

/// Replace characters that are unsafe in object keys with `_`
pub fn make_safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_control() || UNSAFE_NAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Lowercase extension without the leading dot, empty if there is none
pub fn file_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// `".PDF"` and `"pdf"` both become `"pdf"`
pub fn normalize_file_type(file_type: &str) -> String {
    file_type.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Resolve the caller's allow-list against the supported types.
///
/// `None` selects the default types, an empty list selects every supported type.
pub fn resolve_allowed_types(requested: Option<&[String]>) -> BTreeSet<String> {
    match requested {
        None => DEFAULT_ALLOWED_TYPES.iter().map(|t| t.to_string()).collect(),
        Some([]) => SUPPORTED_TYPES.iter().map(|t| t.to_string()).collect(),
        Some(types) => types
            .iter()
            .map(|t| normalize_file_type(t))
            .filter(|t| SUPPORTED_TYPES.contains(&t.as_str()))
            .collect(),
    }
}

pub fn is_metadata_sidecar(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(META_SUFFIX))
        .unwrap_or(false)
}

/// Sidecar location for a file: `a/b.pdf` -> `a/b.pdf.meta.json`
pub fn sidecar_path(path: &Path) -> Option<std::path::PathBuf> {
    let name = path.file_name()?.to_string_lossy();
    Some(path.with_file_name(format!("{}{}", name, META_SUFFIX)))
}

/// Reject sizes above the batch byte ceiling
pub fn validate_file_size(size: u64, max: u64) -> IngestResult<()> {
    if size > max {
        return Err(IngestError::OversizedFile { size, max });
    }
    Ok(())
}

pub fn validate_workspace_name(workspace: &str) -> IngestResult<&str> {
    let trimmed = workspace.trim();
    if trimmed.is_empty() {
        return Err(IngestError::WorkspaceNotDefined);
    }
    Ok(trimmed)
}

/// Parse sidecar content into flat metadata.
///
/// The document must be a JSON object whose values are strings, numbers, booleans or null.
pub fn parse_metadata(path: &Path, content: &str) -> IngestResult<Metadata> {
    let invalid = |message: String| IngestError::InvalidMetadata {
        path: path.display().to_string(),
        message,
    };

    let value: Value = serde_json::from_str(content).map_err(|e| invalid(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(invalid("expected a JSON object".to_string()));
    };

    if let Some((key, _)) = map
        .iter()
        .find(|(_, v)| matches!(v, Value::Object(_) | Value::Array(_)))
    {
        return Err(invalid(format!("value for '{}' is not a scalar", key)));
    }

    Ok(map)
}
