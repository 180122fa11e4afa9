//! Locale detection and per-chat locale state.
//!
//! Detection is a pure, synchronous guess over the message text. The guess is
//! folded onto a small set of languages the relay actually translates
//! between: the Slavic cluster collapses onto Russian and anything outside the
//! basic allow-list is treated as English.

use crate::ChatId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use whatlang::{Detector, Lang, Script};

/// Number of ranked candidates requested from the guesser.
pub const MAX_CANDIDATES: usize = 4;

/// Codes canonicalized to Russian.
pub const SLAVIC_CLUSTER: [&str; 7] = ["bg", "mk", "sr", "mn", "uz", "uk", "kk"];

/// Codes passed through unchanged. Everything else becomes English.
pub const BASIC_LANGUAGES: [&str; 4] = ["en", "fr", "de", "ru"];

/// Statistical language guesser returning codes ranked by confidence.
pub trait LanguageGuesser: Send + Sync {
    fn guess(&self, text: &str, limit: usize) -> Vec<String>;
}

/// Cyrillic languages considered for Cyrillic-script text.
const CYRILLIC_LANGS: [Lang; 5] = [Lang::Rus, Lang::Ukr, Lang::Bul, Lang::Mkd, Lang::Srp];

/// Trigram guesser backed by `whatlang`.
///
/// `whatlang` reports a single winner, so further candidates are produced by
/// re-running detection with every previous winner denied. Cyrillic text is
/// only ranked among `CYRILLIC_LANGS`: on short greetings the trigram scores
/// are too thin to tell Russian from Belarusian.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhatlangGuesser;

impl LanguageGuesser for WhatlangGuesser {
    fn guess(&self, text: &str, limit: usize) -> Vec<String> {
        let cyrillic = whatlang::detect_script(text) == Some(Script::Cyrillic);
        let mut denied: Vec<Lang> = Vec::new();
        let mut candidates = Vec::new();

        while candidates.len() < limit {
            let detector = if cyrillic {
                let allowed: Vec<Lang> = CYRILLIC_LANGS
                    .iter()
                    .copied()
                    .filter(|lang| !denied.contains(lang))
                    .collect();
                if allowed.is_empty() {
                    break;
                }
                Detector::with_allowlist(allowed)
            } else {
                Detector::with_denylist(denied.clone())
            };
            let Some(lang) = detector.detect_lang(text) else {
                break;
            };
            denied.push(lang);
            candidates.push(iso_code(lang).to_string());
        }

        candidates
    }
}

/// ISO 639-1 code for the languages the relay cares about; ISO 639-3 otherwise.
fn iso_code(lang: Lang) -> &'static str {
    match lang {
        Lang::Eng => "en",
        Lang::Rus => "ru",
        Lang::Fra => "fr",
        Lang::Deu => "de",
        Lang::Ukr => "uk",
        Lang::Bul => "bg",
        Lang::Mkd => "mk",
        Lang::Srp => "sr",
        Lang::Uzb => "uz",
        Lang::Bel => "be",
        Lang::Spa => "es",
        Lang::Ita => "it",
        Lang::Por => "pt",
        Lang::Pol => "pl",
        other => other.code(),
    }
}

/// Fold ranked candidates onto a canonical code. Only the top candidate counts.
pub fn canonicalize(candidates: &[String]) -> Option<&'static str> {
    let top = candidates.first()?.as_str();

    if SLAVIC_CLUSTER.contains(&top) {
        return Some("ru");
    }

    Some(
        BASIC_LANGUAGES
            .iter()
            .find(|code| **code == top)
            .copied()
            .unwrap_or("en"),
    )
}

pub struct LocaleDetector {
    guesser: Box<dyn LanguageGuesser>,
}

impl LocaleDetector {
    pub fn new(guesser: Box<dyn LanguageGuesser>) -> Self {
        Self { guesser }
    }

    /// Guess the language of `text`. `None` means no guess; the caller picks a default.
    pub fn detect(&self, text: &str) -> Option<&'static str> {
        canonicalize(&self.guesser.guess(text, MAX_CANDIDATES))
    }
}

impl Default for LocaleDetector {
    fn default() -> Self {
        Self::new(Box::new(WhatlangGuesser))
    }
}

/// Last detected locale per chat.
#[derive(Debug, Clone, Default)]
pub struct LocaleStore {
    locales: Arc<Mutex<HashMap<ChatId, String>>>,
}

impl LocaleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, chat_id: ChatId, code: &str) {
        self.locales
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chat_id, code.to_string());
    }

    pub fn get(&self, chat_id: ChatId) -> Option<String> {
        self.locales
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chat_id)
            .cloned()
    }

    pub fn get_or(&self, chat_id: ChatId, default: &str) -> String {
        self.get(chat_id).unwrap_or_else(|| default.to_string())
    }
}
