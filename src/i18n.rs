//! Language selection and translation.
//!
//! The active language comes from the `lang` cookie when it names a
//! language the translator knows, then from the first known entry of
//! `Accept-Language`, then from the configured default.

use std::collections::HashMap;

use crate::request::Request;

/// Name of the language cookie.
pub const LANG_COOKIE: &str = "lang";

pub trait Translator: Send + Sync {
    /// Translates `text` into `lang`, returning `text` itself when no
    /// translation exists.
    fn translate(&self, lang: &str, text: &str) -> String;

    /// Language codes with translations.
    fn has_language(&self, lang: &str) -> bool;
}

/// Returns every text unchanged.
pub struct NoTranslation;

impl Translator for NoTranslation {
    fn translate(&self, _lang: &str, text: &str) -> String { text.to_owned() }
    fn has_language(&self, _lang: &str) -> bool { false }
}

/// Translations kept in memory, keyed by language then source text.
#[derive(Default)]
pub struct Catalog {
    languages: HashMap<String, HashMap<String, String>>,
}

impl Catalog {
    pub fn new() -> Self { Self::default() }

    pub fn insert(mut self, lang: &str, text: &str, translated: &str) -> Self {
        self.languages
            .entry(lang.to_owned())
            .or_default()
            .insert(text.to_owned(), translated.to_owned());
        self
    }
}

impl Translator for Catalog {
    fn translate(&self, lang: &str, text: &str) -> String {
        self.languages
            .get(lang)
            .and_then(|t| t.get(text))
            .cloned()
            .unwrap_or_else(|| text.to_owned())
    }

    fn has_language(&self, lang: &str) -> bool {
        self.languages.contains_key(lang)
    }
}

/// The chosen language and whether the `lang` cookie should be (re)issued.
#[derive(Debug, PartialEq, Eq)]
pub struct Language {
    pub code: String,
    pub set_cookie: bool,
}

pub fn resolve_language(req: &Request, translator: &dyn Translator, default: &str) -> Language {
    if let Some(code) = req.cookie(LANG_COOKIE) {
        if translator.has_language(code) {
            return Language { code: code.to_owned(), set_cookie: false };
        }
    }

    let accepted = req.header("accept-language").unwrap_or_default();
    for entry in accepted.split(',') {
        let tag = entry.split(';').next().unwrap_or_default().trim();
        let Some(code) = tag.get(..2) else { continue };
        let code = code.to_ascii_lowercase();
        if translator.has_language(&code) {
            return Language { code, set_cookie: true };
        }
    }

    Language { code: default.to_owned(), set_cookie: false }
}
