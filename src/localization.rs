//! Reply text translation

use std::collections::HashMap;
use std::sync::Arc;

/// Translations for one language. Unknown messages pass through unchanged.
#[derive(Debug, Default)]
pub struct Catalog {
    language: String,
    messages: HashMap<String, String>,
}

impl Catalog {
    pub fn new(language: impl Into<String>, messages: HashMap<String, String>) -> Self {
        Self { language: language.into(), messages }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn translate<'a>(&'a self, message: &'a str) -> &'a str {
        self.messages.get(message).map(String::as_str).unwrap_or(message)
    }
}

pub trait CatalogLoader: Send + Sync {
    fn default_language(&self) -> &str;
    fn supported_languages(&self) -> Vec<String>;
    /// Returns `None` for languages the loader doesn't know.
    fn load(&self, language: &str) -> Option<Arc<Catalog>>;
}

/// English only, with identity translation.
#[derive(Debug)]
pub struct DefaultCatalogLoader {
    english: Arc<Catalog>,
}

impl Default for DefaultCatalogLoader {
    fn default() -> Self {
        Self { english: Arc::new(Catalog::new("en", HashMap::new())) }
    }
}

impl CatalogLoader for DefaultCatalogLoader {
    fn default_language(&self) -> &str {
        "en"
    }

    fn supported_languages(&self) -> Vec<String> {
        vec!["en".to_string()]
    }

    fn load(&self, language: &str) -> Option<Arc<Catalog>> {
        // Accept regional variants such as en-US
        let primary = language.split(['-', '_']).next().unwrap_or(language);
        primary.eq_ignore_ascii_case("en").then(|| self.english.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_variants_load() {
        let loader = DefaultCatalogLoader::default();
        assert_eq!(loader.load("EN-us").unwrap().language(), "en");
        assert!(loader.load("de").is_none());
    }

    #[test]
    fn unknown_messages_pass_through() {
        let mut messages = HashMap::new();
        messages.insert("Command okay.".to_string(), "Befehl okay.".to_string());
        let catalog = Catalog::new("de", messages);
        assert_eq!(catalog.translate("Command okay."), "Befehl okay.");
        assert_eq!(catalog.translate("Bye"), "Bye");
    }
}
