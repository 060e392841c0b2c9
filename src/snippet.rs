use std::path::{Component, Path};

use crate::config::IndexRoot;
use crate::error::MemoryError;

/// Read a raw line slice from a corpus file, for citation follow-up
/// independent of search.
///
/// `path` is a stored relative path; it is resolved against the configured
/// index roots in order, and anything that would escape them — absolute
/// paths, `..` traversal — fails with `NotFound` rather than leaking files
/// outside the corpus. `from_line` is 1-based; omitted bounds read to the
/// end of the file.
pub fn read_slice(
    roots: &[IndexRoot],
    path: &str,
    from_line: Option<u32>,
    line_count: Option<u32>,
) -> Result<String, MemoryError> {
    let rel = Path::new(path);
    if rel.as_os_str().is_empty() || !is_confined(rel) {
        return Err(MemoryError::NotFound(rel.to_path_buf()));
    }

    for root in roots {
        let candidate = root.path.join(rel);
        if !candidate.is_file() {
            continue;
        }
        let content = match std::fs::read_to_string(&candidate) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        return Ok(slice_lines(&content, from_line, line_count));
    }

    Err(MemoryError::NotFound(rel.to_path_buf()))
}

/// A relative path stays confined when it has no root/prefix component and
/// never steps upward.
fn is_confined(path: &Path) -> bool {
    !path.is_absolute()
        && path.components().all(|c| {
            matches!(c, Component::Normal(_) | Component::CurDir)
        })
}

fn slice_lines(content: &str, from_line: Option<u32>, line_count: Option<u32>) -> String {
    let skip = from_line.map(|f| f.saturating_sub(1) as usize).unwrap_or(0);
    let take = line_count.map(|c| c as usize).unwrap_or(usize::MAX);
    content
        .lines()
        .skip(skip)
        .take(take)
        .collect::<Vec<_>>()
        .join("\n")
}
