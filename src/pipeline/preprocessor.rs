//! Preprocessor: turns a raw payload into a clean `Conversation`.
//!
//! Every step is a hard gate. A payload that fails one is dropped (not
//! retried), and the drop reason is reported back to the caller:
//! 1. Reject empty subject + body
//! 2. Strip HTML markup to newline-separated text
//! 3. Strip trailing "sent from my ..." footers
//! 4. Merge subject and bodies
//! 5. Reject empty merged text
//! 6. Detect language, reject languages outside the allowlist
//! 7. Reject spam keywords
//! 8. Score thread consistency
//! 9. Pick the conversation id
//!
//! Pure string processing. No I/O, no randomness.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node};
use tracing::debug;
use whatlang::{Detector, Lang, Script};

use crate::config::PreprocessConfig;
use crate::pipeline::types::{Conversation, EmailPayload};

/// Locale variants of mobile-client footers. Only the first match is used.
static FOOTER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(sent from my (iphone|android)|envoyé de mon|enviado desde mi)").unwrap()
});

/// Elements whose text never reaches the conversation body.
const SKIPPED_TAGS: &[&str] = &["script", "style", "head", "title", "noscript"];

/// Elements rendered on their own line.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "ul", "ol", "tr", "table", "h1", "h2", "h3", "h4", "h5", "h6",
    "blockquote", "pre", "section", "article", "header", "footer", "hr",
];

/// ISO 639-1 codes for the languages the detector knows by name.
const LANGUAGE_CODES: &[(&str, Lang)] = &[
    ("en", Lang::Eng),
    ("es", Lang::Spa),
    ("fr", Lang::Fra),
    ("de", Lang::Deu),
    ("it", Lang::Ita),
    ("pt", Lang::Por),
    ("nl", Lang::Nld),
    ("ru", Lang::Rus),
    ("uk", Lang::Ukr),
    ("pl", Lang::Pol),
    ("sv", Lang::Swe),
    ("da", Lang::Dan),
    ("nb", Lang::Nob),
    ("fi", Lang::Fin),
    ("tr", Lang::Tur),
    ("cs", Lang::Ces),
    ("ro", Lang::Ron),
    ("hu", Lang::Hun),
    ("el", Lang::Ell),
    ("zh", Lang::Cmn),
    ("ja", Lang::Jpn),
    ("ko", Lang::Kor),
    ("ar", Lang::Ara),
    ("he", Lang::Heb),
    ("hi", Lang::Hin),
    ("vi", Lang::Vie),
    ("th", Lang::Tha),
    ("id", Lang::Ind),
];

/// Languages always considered during detection, besides the allowlist.
/// Disallowed languages must stay candidates or they can never be rejected.
const DEFAULT_CANDIDATES: &[Lang] = &[
    Lang::Eng,
    Lang::Spa,
    Lang::Fra,
    Lang::Deu,
    Lang::Ita,
    Lang::Por,
    Lang::Nld,
    Lang::Rus,
    Lang::Cmn,
    Lang::Jpn,
    Lang::Kor,
    Lang::Ara,
];

// ── Language detection ──────────────────────────────────────────────

/// Deterministic language detection.
pub trait LanguageDetector: Send + Sync {
    /// Dominant language code of `text`, or `None` if undetectable.
    fn detect(&self, text: &str) -> Option<String>;
}

/// Minimum share of letters in scripts no allowed language is written in
/// for detection to run on those letters alone.
const FOREIGN_SCRIPT_SHARE: f64 = 0.3;

/// Trigram detector backed by `whatlang`.
///
/// Short texts rarely produce a reliable trigram guess. An unreliable guess
/// outside the allowlist only stands if it also reliably beats every
/// allowed language head to head; otherwise the closest allowed language
/// wins. Mixed-script texts are judged by their foreign-script letters.
pub struct WhatlangDetector {
    detector: Detector,
    allowed: Vec<Lang>,
    allowed_scripts: Vec<Script>,
}

impl WhatlangDetector {
    /// Build a detector whose candidates are the defaults plus `allowed`.
    pub fn new(allowed: &[String]) -> Self {
        let mut allowed_langs: Vec<Lang> = Vec::new();
        for lang in allowed.iter().filter_map(|code| lang_for_code(code)) {
            if !allowed_langs.contains(&lang) {
                allowed_langs.push(lang);
            }
        }

        let mut candidates = DEFAULT_CANDIDATES.to_vec();
        for lang in &allowed_langs {
            if !candidates.contains(lang) {
                candidates.push(*lang);
            }
        }

        let allowed_scripts = Script::all()
            .iter()
            .copied()
            .filter(|script| written_in(*script, &allowed_langs))
            .collect();

        Self {
            detector: Detector::with_allowlist(candidates),
            allowed: allowed_langs,
            allowed_scripts,
        }
    }

    /// `text` with allowed-script letters blanked, if foreign letters make
    /// up at least [`FOREIGN_SCRIPT_SHARE`] of all letters.
    fn foreign_text(&self, text: &str) -> Option<String> {
        let mut letters = 0usize;
        let mut foreign = 0usize;
        let masked: String = text
            .chars()
            .map(|ch| match script_of(ch) {
                Some(script) if self.allowed_scripts.contains(&script) => {
                    letters += 1;
                    ' '
                }
                Some(_) => {
                    letters += 1;
                    foreign += 1;
                    ch
                }
                None => ch,
            })
            .collect();
        (letters > 0 && foreign as f64 / letters as f64 >= FOREIGN_SCRIPT_SHARE).then_some(masked)
    }

    /// Whether `guess` reliably wins a two-language detection against `allowed`.
    fn beats(&self, text: &str, guess: Lang, allowed: Lang) -> bool {
        Detector::with_allowlist(vec![guess, allowed])
            .detect(text)
            .is_some_and(|info| info.lang() == guess && info.is_reliable())
    }
}

impl LanguageDetector for WhatlangDetector {
    fn detect(&self, text: &str) -> Option<String> {
        if let Some(foreign) = self.foreign_text(text) {
            return self.detector.detect(&foreign).map(|info| code_for_lang(info.lang()));
        }

        let guess = self.detector.detect(text)?;
        let lang = guess.lang();
        if guess.is_reliable() || self.allowed.contains(&lang) {
            return Some(code_for_lang(lang));
        }

        let closest_allowed = self
            .allowed
            .iter()
            .copied()
            .find(|allowed| !self.beats(text, lang, *allowed));
        Some(code_for_lang(closest_allowed.unwrap_or(lang)))
    }
}

fn script_of(ch: char) -> Option<Script> {
    let mut buf = [0u8; 4];
    whatlang::detect_script(ch.encode_utf8(&mut buf))
}

/// Kanji share the Mandarin script, which whatlang maps to Chinese only.
fn written_in(script: Script, langs: &[Lang]) -> bool {
    langs.iter().any(|lang| {
        script.langs().contains(lang) || (*lang == Lang::Jpn && script == Script::Mandarin)
    })
}

fn lang_for_code(code: &str) -> Option<Lang> {
    let code = code.trim().to_lowercase();
    LANGUAGE_CODES
        .iter()
        .find(|(iso, _)| *iso == code)
        .map(|(_, lang)| *lang)
        .or_else(|| Lang::from_code(&code))
}

fn code_for_lang(lang: Lang) -> String {
    LANGUAGE_CODES
        .iter()
        .find(|(_, l)| *l == lang)
        .map(|(iso, _)| iso.to_string())
        .unwrap_or_else(|| lang.code().to_string())
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Why a payload was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    EmptyContent,
    EmptyAfterCleaning,
    LanguageUndetected,
    LanguageNotAllowed(String),
    Spam(String),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyContent => write!(f, "empty subject and body"),
            Self::EmptyAfterCleaning => write!(f, "empty after cleaning"),
            Self::LanguageUndetected => write!(f, "language could not be detected"),
            Self::LanguageNotAllowed(lang) => write!(f, "language '{lang}' not allowed"),
            Self::Spam(keyword) => write!(f, "spam keyword '{keyword}'"),
        }
    }
}

/// Result of running the preprocessor.
#[derive(Debug, Clone, PartialEq)]
pub enum PreprocessOutcome {
    Accepted(Conversation),
    Dropped(DropReason),
}

impl PreprocessOutcome {
    pub fn into_conversation(self) -> Option<Conversation> {
        match self {
            Self::Accepted(conversation) => Some(conversation),
            Self::Dropped(_) => None,
        }
    }
}

// ── Preprocessor ────────────────────────────────────────────────────

/// Stateless payload cleaner. Build once, share across workers.
pub struct Preprocessor {
    config: PreprocessConfig,
    detector: Box<dyn LanguageDetector>,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        let detector = Box::new(WhatlangDetector::new(&config.allowed_languages));
        Self { config, detector }
    }

    /// Use a custom language detector.
    pub fn with_detector(config: PreprocessConfig, detector: Box<dyn LanguageDetector>) -> Self {
        Self { config, detector }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Clean and merge a payload, or `None` if it must be dropped.
    pub fn preprocess(&self, payload: &EmailPayload) -> Option<Conversation> {
        self.run(payload).into_conversation()
    }

    /// Like [`Preprocessor::preprocess`] but reports why a payload was dropped.
    pub fn run(&self, payload: &EmailPayload) -> PreprocessOutcome {
        let outcome = self.run_steps(payload);
        if let PreprocessOutcome::Dropped(ref reason) = outcome {
            debug!(id = %payload.message_id, reason = %reason, "Payload dropped by preprocessor");
        }
        outcome
    }

    fn run_steps(&self, payload: &EmailPayload) -> PreprocessOutcome {
        let subject = payload.subject.trim();
        let body = payload.body.trim();
        if subject.is_empty() && body.is_empty() {
            return PreprocessOutcome::Dropped(DropReason::EmptyContent);
        }

        // Earlier thread messages first, then the payload's own body.
        let cleaned: Vec<String> = payload
            .thread
            .iter()
            .map(|m| m.body.as_str())
            .chain(std::iter::once(body))
            .map(clean_body)
            .filter(|b| !b.is_empty())
            .collect();

        let merged = merge_text(subject, &cleaned);
        if merged.is_empty() {
            return PreprocessOutcome::Dropped(DropReason::EmptyAfterCleaning);
        }

        let Some(language) = self.detector.detect(&merged) else {
            return PreprocessOutcome::Dropped(DropReason::LanguageUndetected);
        };
        if !self
            .config
            .allowed_languages
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&language))
        {
            return PreprocessOutcome::Dropped(DropReason::LanguageNotAllowed(language));
        }

        if let Some(keyword) = find_spam_keyword(&merged, &self.config.spam_keywords) {
            return PreprocessOutcome::Dropped(DropReason::Spam(keyword.to_string()));
        }

        let thread_consistency = if payload.thread.is_empty() {
            thread_consistency(&[merged.as_str()])
        } else {
            thread_consistency(&cleaned)
        };

        PreprocessOutcome::Accepted(Conversation {
            conversation_id: payload.conversation_key().to_string(),
            body: merged,
            language,
            thread_consistency,
        })
    }
}

/// Preprocess with default spam keywords and the given language allowlist.
pub fn preprocess_payload(payload: &EmailPayload, allowed_languages: &[String]) -> Option<Conversation> {
    let config = PreprocessConfig {
        allowed_languages: allowed_languages.to_vec(),
        ..PreprocessConfig::default()
    };
    Preprocessor::new(config).preprocess(payload)
}

// ── Text helpers ────────────────────────────────────────────────────

fn clean_body(raw: &str) -> String {
    strip_footer(&strip_html(raw))
}

fn merge_text(subject: &str, bodies: &[String]) -> String {
    format!("{}\n\n{}", subject, bodies.join("\n"))
        .trim()
        .to_string()
}

/// Convert HTML (or plain text) into newline-separated plain text.
pub fn strip_html(raw: &str) -> String {
    let fragment = Html::parse_fragment(raw);
    let mut out = String::with_capacity(raw.len());
    collect_text(fragment.root_element(), &mut out);
    collapse_blank_lines(&out)
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_TAGS.contains(&name) {
                    continue;
                }
                if name == "br" {
                    out.push('\n');
                    continue;
                }
                let block = BLOCK_TAGS.contains(&name);
                if block {
                    out.push('\n');
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                }
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// Trim line ends, keep at most one blank line in a row, drop outer blanks.
fn collapse_blank_lines(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            if lines.last().is_some_and(|l| !l.is_empty()) {
                lines.push("");
            }
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Truncate at the first footer marker and trim trailing whitespace.
pub fn strip_footer(text: &str) -> String {
    match FOOTER_REGEX.find(text) {
        Some(m) => text[..m.start()].trim_end().to_string(),
        None => text.to_string(),
    }
}

fn find_spam_keyword<'a>(text: &str, keywords: &'a [String]) -> Option<&'a str> {
    let lowered = text.to_lowercase();
    keywords
        .iter()
        .map(String::as_str)
        .find(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
}

/// Similar-length, non-empty segments score close to 1.0.
///
/// `clamp(1 / (1 + variance / (mean + 1)), 0, 1)` over segment lengths in
/// characters, using the population variance. No segments scores 0.0.
pub fn thread_consistency<S: AsRef<str>>(parts: &[S]) -> f64 {
    let lengths: Vec<f64> = parts
        .iter()
        .map(AsRef::as_ref)
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.chars().count() as f64)
        .collect();
    if lengths.is_empty() {
        return 0.0;
    }
    let n = lengths.len() as f64;
    let avg = lengths.iter().sum::<f64>() / n;
    let variance = lengths.iter().map(|l| (l - avg) * (l - avg)).sum::<f64>() / n;
    (1.0 / (1.0 + variance / (avg + 1.0))).clamp(0.0, 1.0)
}
