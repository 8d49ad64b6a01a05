//! Text extraction used to double-check visual matches.

use std::{
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_LANGUAGES: &str = "eng";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything that can read the text off an image.
pub trait OcrEngine: Send + Sync {
    fn extract_text(
        &self,
        image: &Path,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Runs the `tesseract` command line tool.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    binary: PathBuf,
    languages: String,
}

impl TesseractOcr {
    /// `languages` uses tesseract's `-l` syntax, e.g. `eng+deu`.
    pub fn new(languages: impl Into<String>) -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            languages: languages.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn languages(&self) -> &str {
        &self.languages
    }
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self::new(DEFAULT_LANGUAGES)
    }
}

impl OcrEngine for TesseractOcr {
    async fn extract_text(&self, image: &Path) -> Result<String> {
        let output = tokio::process::Command::new(&self.binary)
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Ocr(format!("{}: {e}", self.binary.display())))?;

        if !output.status.success() {
            return Err(Error::Ocr(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Run `engine` on `image`, turning failures and timeouts into empty text.
pub async fn extract_or_empty<E: OcrEngine>(
    engine: &E,
    image: &Path,
    timeout: Duration,
) -> String {
    match tokio::time::timeout(timeout, engine.extract_text(image)).await {
        Ok(Ok(text)) => {
            debug!(image = %image.display(), chars = text.len(), "extracted text");
            text
        }
        Ok(Err(e)) => {
            warn!(image = %image.display(), "OCR failed: {e}");
            String::new()
        }
        Err(_) => {
            warn!(image = %image.display(), ?timeout, "OCR timed out");
            String::new()
        }
    }
}

/// Whether the snippet's text appears verbatim in the page's text.
///
/// Both sides are trimmed first; an empty snippet never matches.
///
/// # Examples
///
/// ```
/// use snipseek::ocr::text_matches;
///
/// assert!(text_matches("  net revenue\n", "Q3 net revenue grew"));
/// assert!(!text_matches("   ", "anything"));
/// ```
pub fn text_matches(snippet_text: &str, page_text: &str) -> bool {
    let needle = snippet_text.trim();
    !needle.is_empty() && page_text.trim().contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl OcrEngine for Fixed {
        async fn extract_text(&self, _image: &Path) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Failing;

    impl OcrEngine for Failing {
        async fn extract_text(&self, image: &Path) -> Result<String> {
            Err(Error::Ocr(format!("cannot read {}", image.display())))
        }
    }

    struct Slow;

    impl OcrEngine for Slow {
        async fn extract_text(&self, _image: &Path) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    #[test]
    fn substring_after_trimming() {
        assert!(text_matches("hello", "  say hello world  "));
        assert!(text_matches("\thello world\n", "hello world"));
        assert!(!text_matches("goodbye", "hello world"));
        assert!(!text_matches("", "hello"));
        assert!(!text_matches("\n \t", "hello"));
    }

    #[test]
    fn match_is_case_sensitive() {
        assert!(!text_matches("Hello", "hello"));
    }

    #[tokio::test]
    async fn text_is_passed_through() {
        let text = extract_or_empty(&Fixed("abc"), Path::new("x.png"), DEFAULT_TIMEOUT).await;
        assert_eq!(text, "abc");
    }

    #[tokio::test]
    async fn failure_becomes_empty_text() {
        let text = extract_or_empty(&Failing, Path::new("x.png"), DEFAULT_TIMEOUT).await;
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn timeout_becomes_empty_text() {
        let text =
            extract_or_empty(&Slow, Path::new("x.png"), Duration::from_millis(20)).await;
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_an_ocr_error() {
        let engine = TesseractOcr::default().with_binary("/nonexistent/tesseract-binary");
        let err = engine.extract_text(Path::new("x.png")).await.unwrap_err();
        assert!(matches!(err, Error::Ocr(_)));
    }
}
