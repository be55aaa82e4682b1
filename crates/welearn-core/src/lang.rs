//! Statistical language detection restricted to the languages the corpus
//! is indexed in.

use thiserror::Error;
use whatlang::Lang;

/// ISO 639-1 codes of the languages with a vector collection.
pub const SUPPORTED_LANGUAGES: [&str; 2] = ["en", "fr"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LanguageError {
    #[error("Language not supported")]
    NotSupported,
}

/// Detect the ISO 639-1 code of `text`. Only `en` and `fr` are returned.
pub fn detect_language(text: &str) -> Result<String, LanguageError> {
    if text.trim().is_empty() {
        return Err(LanguageError::NotSupported);
    }
    match whatlang::detect_lang(text) {
        Some(Lang::Eng) => Ok("en".to_string()),
        Some(Lang::Fra) => Ok("fr".to_string()),
        _ => Err(LanguageError::NotSupported),
    }
}

/// Whether `code` is one of [`SUPPORTED_LANGUAGES`].
pub fn is_supported(code: &str) -> bool {
    SUPPORTED_LANGUAGES.contains(&code)
}
