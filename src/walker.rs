use std::path::Path;

use crate::{error::Result, page::Page};

/// Image extensions recognised as rasterized pages (compared case-insensitively).
const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Separator between the PDF name and the page number in rasterized file
/// names, e.g. `annual-report_page_0004.png`.
const PAGE_MARKER: &str = "_page_";

/// Recursively walk a directory and discover rasterized page images.
///
/// Skips hidden files/directories (names starting with `.`). Results are
/// sorted by path so repeated runs produce the same corpus order.
pub fn discover_pages(root: &Path) -> Result<Vec<Page>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &mut results)?;
    results.sort_by(|a, b| a.image_path.cmp(&b.image_path));
    Ok(results)
}

fn walk_dir(current: &Path, results: &mut Vec<Page>) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(&entry.path(), results)?;
        } else if (file_type.is_file() || file_type.is_symlink())
            && is_supported(&entry.path())
        {
            // Broken symlinks are skipped.
            let Ok(absolute) = entry.path().canonicalize() else {
                continue;
            };
            if absolute.is_file() {
                results.push(page_from_path(&absolute));
            }
        }
    }

    Ok(())
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}

/// Derive the page identity from an image file name.
///
/// `<pdf_id>_page_<n>.<ext>` yields `(pdf_id, n)`. A name without the
/// marker, or with an unparsable number, uses the whole stem (or the
/// prefix) as the PDF id and `-1` as the page number.
pub fn page_from_path(path: &Path) -> Page {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (pdf_id, page_number) = match stem.split_once(PAGE_MARKER) {
        Some((prefix, number)) => {
            (prefix.to_string(), number.parse().unwrap_or(-1))
        }
        None => (stem, -1),
    };

    Page::new(pdf_id, page_number, path)
}
