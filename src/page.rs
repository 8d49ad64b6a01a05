use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A rasterized page image of a source PDF.
///
/// The whole triple is the page's identity: two records naming the same
/// PDF and page number but different image files are different pages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Page {
    pub pdf_id: String,
    /// 1-based page number, or `-1` when the image name carries none.
    #[serde(alias = "page")]
    pub page_number: i64,
    #[serde(alias = "path")]
    pub image_path: PathBuf,
}

impl Page {
    pub fn new(
        pdf_id: impl Into<String>,
        page_number: i64,
        image_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pdf_id: pdf_id.into(),
            page_number,
            image_path: image_path.into(),
        }
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} p.{} ({})",
            self.pdf_id,
            self.page_number,
            self.image_path.display()
        )
    }
}

/// An insertion-ordered set of pages keyed by their identity.
///
/// Re-inserting an existing key replaces the stored record in place
/// (last write wins) without moving it, so iteration order is the order
/// in which each key was first seen.
#[derive(Debug, Default)]
pub struct PageSet {
    positions: HashMap<Page, usize>,
    pages: Vec<Page>,
}

impl PageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a page, returning `true` if its key was not present before.
    pub fn insert(&mut self, page: Page) -> bool {
        match self.positions.entry(page.clone()) {
            Entry::Occupied(slot) => {
                self.pages[*slot.get()] = page;
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(self.pages.len());
                self.pages.push(page);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter()
    }

    pub fn into_vec(self) -> Vec<Page> {
        self.pages
    }
}

impl FromIterator<Page> for PageSet {
    fn from_iter<I: IntoIterator<Item = Page>>(iter: I) -> Self {
        let mut set = Self::new();
        for page in iter {
            set.insert(page);
        }
        set
    }
}

/// Deduplicate page records by `(pdf_id, page_number, image_path)`.
///
/// # Examples
///
/// ```
/// use snipseek::page::{Page, dedupe_pages};
///
/// let pages = dedupe_pages(vec![
///     Page::new("report", 1, "pages/report_page_0001.png"),
///     Page::new("report", 2, "pages/report_page_0002.png"),
///     Page::new("report", 1, "pages/report_page_0001.png"),
/// ]);
/// assert_eq!(pages.len(), 2);
/// assert_eq!(pages[0].page_number, 1);
/// ```
pub fn dedupe_pages(records: impl IntoIterator<Item = Page>) -> Vec<Page> {
    records.into_iter().collect::<PageSet>().into_vec()
}

/// Read page records from a JSON array.
///
/// Accepts both plain page records and training-pair records (the extra
/// `bbox` field is ignored), so the file written by `prepare` can feed the
/// index builder directly.
pub fn load_page_records(path: &Path) -> Result<Vec<Page>> {
    let file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound {
            kind: "page records",
            path: path.to_path_buf(),
        },
        _ => Error::Io(e),
    })?;
    let pages: Vec<Page> =
        serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_insertion_order_is_kept() {
        let pages = dedupe_pages(vec![
            Page::new("b", 1, "b1.png"),
            Page::new("a", 1, "a1.png"),
            Page::new("b", 1, "b1.png"),
            Page::new("a", 2, "a2.png"),
        ]);
        let ids: Vec<_> = pages
            .iter()
            .map(|p| (p.pdf_id.as_str(), p.page_number))
            .collect();
        assert_eq!(ids, vec![("b", 1), ("a", 1), ("a", 2)]);
    }

    #[test]
    fn same_page_number_different_path_is_distinct() {
        let pages = dedupe_pages(vec![
            Page::new("doc", 3, "scan_a.png"),
            Page::new("doc", 3, "scan_b.png"),
        ]);
        assert_eq!(pages.len(), 2);
    }

    #[test]
    fn insert_reports_new_keys() {
        let mut set = PageSet::new();
        assert!(set.insert(Page::new("doc", 1, "p1.png")));
        assert!(!set.insert(Page::new("doc", 1, "p1.png")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn records_accept_training_pair_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("meta.json");
        std::fs::write(
            &path,
            r#"[
                {"pdf_id": "doc", "page": 1, "path": "doc_page_0001.png", "bbox": [1, 2, 3, 4]},
                {"pdf_id": "doc", "page_number": 2, "image_path": "doc_page_0002.png"}
            ]"#,
        )
        .unwrap();

        let pages = load_page_records(&path).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0], Page::new("doc", 1, "doc_page_0001.png"));
        assert_eq!(pages[1].page_number, 2);
    }

    #[test]
    fn missing_records_file_is_not_found() {
        let err = load_page_records(Path::new("/nonexistent/meta.json"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    proptest! {
        #[test]
        fn one_entry_per_distinct_key(
            raw in proptest::collection::vec((0u8..4, 0i64..4, 0u8..3), 0..40)
        ) {
            let records: Vec<Page> = raw
                .iter()
                .map(|(pdf, page, file)| {
                    Page::new(format!("pdf{pdf}"), *page, format!("img{file}.png"))
                })
                .collect();
            let distinct: std::collections::HashSet<_> =
                records.iter().cloned().collect();

            let pages = dedupe_pages(records);
            prop_assert_eq!(pages.len(), distinct.len());

            let unique: std::collections::HashSet<_> =
                pages.iter().cloned().collect();
            prop_assert_eq!(unique.len(), pages.len());
        }
    }
}
