use unicode_normalization::UnicodeNormalization;

use crate::LixError;

#[derive(Debug, Clone)]
pub(crate) struct ParsedFilePath {
    pub(crate) normalized_path: String,
    pub(crate) directory_path: Option<String>,
    pub(crate) name: String,
    pub(crate) extension: Option<String>,
}

pub(crate) fn normalize_path_segment(raw: &str) -> Result<String, LixError> {
    let normalized = raw.nfc().collect::<String>();
    if normalized.is_empty() {
        return Err(LixError::validation("path segment must not be empty"));
    }
    if normalized == "." || normalized == ".." {
        return Err(LixError::validation("path segment cannot be '.' or '..'"));
    }
    if normalized.contains('/') || normalized.contains('\\') {
        return Err(LixError::validation("path segment must not contain slashes"));
    }
    if normalized.contains('\0') {
        return Err(LixError::validation("path segment must not contain NUL"));
    }
    Ok(normalized)
}

pub(crate) fn normalize_file_path(path: &str) -> Result<String, LixError> {
    let normalized = path.nfc().collect::<String>();
    if !normalized.starts_with('/') || normalized.ends_with('/') || normalized == "/" {
        return Err(invalid_file_path(path));
    }
    if normalized.contains('\\') || normalized.contains("//") || normalized.contains('\0') {
        return Err(invalid_file_path(path));
    }
    let segments = normalized
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    if segments.is_empty() {
        return Err(invalid_file_path(path));
    }
    for segment in &segments {
        let _ = normalize_path_segment(segment)?;
    }
    Ok(format!("/{}", segments.join("/")))
}

pub(crate) fn normalize_directory_path(path: &str) -> Result<String, LixError> {
    let normalized = path.nfc().collect::<String>();
    if !normalized.starts_with('/') || !normalized.ends_with('/') || normalized == "/" {
        return Err(invalid_directory_path(path));
    }
    if normalized.contains('\\') || normalized.contains("//") || normalized.contains('\0') {
        return Err(invalid_directory_path(path));
    }
    let mut normalized_segments: Vec<String> = Vec::new();
    for segment in normalized.split('/').filter(|segment| !segment.is_empty()) {
        normalized_segments.push(normalize_path_segment(segment)?);
    }
    if normalized_segments.is_empty() {
        return Err(invalid_directory_path(path));
    }
    Ok(format!("/{}/", normalized_segments.join("/")))
}

pub(crate) fn parse_file_path(path: &str) -> Result<ParsedFilePath, LixError> {
    let normalized_path = normalize_file_path(path)?;
    let segments = normalized_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    let file_name = segments.last().ok_or_else(|| invalid_file_path(path))?;
    let directory_path = if segments.len() > 1 {
        Some(format!("/{}/", segments[..segments.len() - 1].join("/")))
    } else {
        None
    };

    let last_dot = file_name.rfind('.');
    let (name, extension) = match last_dot {
        Some(index) if index > 0 => {
            let name = file_name[..index].to_string();
            let extension = file_name[index + 1..].to_string();
            let extension = if extension.is_empty() {
                None
            } else {
                Some(extension)
            };
            (name, extension)
        }
        _ => (file_name.to_string(), None),
    };

    Ok(ParsedFilePath {
        normalized_path,
        directory_path,
        name,
        extension,
    })
}

/// All ancestor directory paths of a file or directory path, shallowest
/// first, excluding the entry itself.
pub(crate) fn ancestor_directory_paths(path: &str) -> Vec<String> {
    let segments = path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    if segments.len() <= 1 {
        return Vec::new();
    }

    let mut ancestors = Vec::with_capacity(segments.len() - 1);
    let mut prefix_segments: Vec<&str> = Vec::with_capacity(segments.len() - 1);
    for segment in segments.iter().take(segments.len() - 1) {
        prefix_segments.push(segment);
        ancestors.push(format!("/{}/", prefix_segments.join("/")));
    }
    ancestors
}

pub(crate) fn parent_directory_path(path: &str) -> Option<String> {
    let segments = path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    if segments.len() <= 1 {
        return None;
    }
    Some(format!("/{}/", segments[..segments.len() - 1].join("/")))
}

pub(crate) fn directory_name_from_path(path: &str) -> Option<String> {
    path.trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(|segment| segment.to_string())
}

fn invalid_file_path(path: &str) -> LixError {
    LixError::validation(format!("invalid file path '{path}'"))
}

fn invalid_directory_path(path: &str) -> LixError {
    LixError::validation(format!("invalid directory path '{path}'"))
}
