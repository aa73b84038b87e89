//! Filename and size formatting helpers.
//!
//! Storage keys are derived from user supplied filenames. The stem is slugified
//! so keys stay URL-safe, an optional id prefix keeps them unique, and the
//! extension is carried over untouched.

use std::path::Path;

/// Number of id characters appended to a keyname.
pub const KEYNAME_ID_LEN: usize = 5;

/// Number of id characters appended to a downloadable filename.
pub const DOWNLOAD_ID_LEN: usize = 10;

const SIZE_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// Derive a storage-safe filename.
///
/// Returns `None` when there is nothing to derive a name from: a missing or
/// empty filename, or one whose stem slugifies to nothing and has no extension.
///
/// ```text
/// normalize_filename(Some("My Report.PDF"), Some("abcdef1234"), 5) == Some("my_report_abcde.PDF")
/// ```
pub fn normalize_filename(
    filename: Option<&str>,
    entity_id: Option<&str>,
    id_prefix_len: usize,
) -> Option<String> {
    let filename = filename.filter(|f| !f.is_empty())?;
    let (stem, extension) = split_filename(filename);

    let stem = match entity_id {
        Some(id) => {
            let prefix: String = id.chars().take(id_prefix_len).collect();
            format!("{}_{}", stem, prefix)
        }
        None => stem.to_string(),
    };
    let stem = slug::slugify(stem).replace('-', "_");

    let normalized = match extension {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem,
    };
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Split a filename into its stem and extension the way `std::path` does for
/// the final path component.
pub fn split_filename(filename: &str) -> (&str, Option<&str>) {
    let path = Path::new(filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty());
    (stem, extension)
}

/// Extension of a filename, without the leading dot.
pub fn file_extension(filename: &str) -> Option<String> {
    split_filename(filename).1.map(str::to_string)
}

/// MIME type implied by a filename's extension, if it is a known one.
pub fn guess_content_type(filename: &str) -> Option<String> {
    file_extension(filename)?;
    mime_guess::from_path(filename)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

/// Render a byte count for humans, e.g. `100 B` or `1.50 KB`.
pub fn humanize_filesize(size_in_bytes: i64) -> String {
    let mut size = size_in_bytes.max(0) as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", size as i64, SIZE_UNITS[unit])
    } else {
        format!("{:.2} {}", size, SIZE_UNITS[unit])
    }
}
