//! Templating utilities available to default-value scripts: prompts, date
//! formatting with moment-style tokens, wiki links and language detection.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local};
use tracing::debug;

use crate::Result;
use crate::script_host::{DayOffset, ScriptUtilities};

pub const DEFAULT_DATE_FORMAT: &str = "YYYY-MM-DD";

#[async_trait]
pub trait TemplatingPlugin: Send + Sync {
    fn is_available(&self) -> bool;

    async fn prompt(&self, message: &str, default: &str) -> Result<String>;

    fn now(&self, format: Option<&str>) -> String;

    fn tomorrow(&self, format: Option<&str>) -> String;

    fn yesterday(&self, format: Option<&str>) -> String;
}

/// Date helpers on chrono. Prompts answer with their default value since
/// there is nobody to ask.
#[derive(Debug, Clone, Default)]
pub struct ChronoTemplating {
    clock: Option<DateTime<Local>>,
}

impl ChronoTemplating {
    /// Pins "now" to a fixed instant.
    pub fn with_clock(now: DateTime<Local>) -> Self {
        Self { clock: Some(now) }
    }

    fn current(&self) -> DateTime<Local> {
        self.clock.unwrap_or_else(Local::now)
    }

    fn format_day(&self, offset: DayOffset, format: Option<&str>) -> String {
        let base = self.current();
        let day = match offset {
            DayOffset::Today => base,
            DayOffset::Tomorrow => base + Duration::days(1),
            DayOffset::Yesterday => base - Duration::days(1),
        };
        let pattern = moment_to_chrono(format.unwrap_or(DEFAULT_DATE_FORMAT));
        day.format(&pattern).to_string()
    }
}

#[async_trait]
impl TemplatingPlugin for ChronoTemplating {
    fn is_available(&self) -> bool {
        true
    }

    async fn prompt(&self, message: &str, default: &str) -> Result<String> {
        debug!(message, default, "prompt answered with default");
        Ok(default.to_string())
    }

    fn now(&self, format: Option<&str>) -> String {
        self.format_day(DayOffset::Today, format)
    }

    fn tomorrow(&self, format: Option<&str>) -> String {
        self.format_day(DayOffset::Tomorrow, format)
    }

    fn yesterday(&self, format: Option<&str>) -> String {
        self.format_day(DayOffset::Yesterday, format)
    }
}

#[async_trait]
impl ScriptUtilities for ChronoTemplating {
    async fn prompt(&self, message: &str, default: &str) -> Result<String> {
        TemplatingPlugin::prompt(self, message, default).await
    }

    fn date(&self, offset: DayOffset, format: Option<&str>) -> String {
        self.format_day(offset, format)
    }

    fn markdown_link(&self, target: &str, alias: Option<&str>) -> String {
        markdown_link(target, alias)
    }

    fn detect_language(&self, text: &str) -> String {
        detect_language(text).to_string()
    }
}

/// Translates a moment.js format string to a chrono one. Text inside
/// `[...]` is copied literally.
pub fn moment_to_chrono(format: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("YYYY", "%Y"),
        ("YY", "%y"),
        ("MMMM", "%B"),
        ("MMM", "%b"),
        ("MM", "%m"),
        ("M", "%-m"),
        ("DDDD", "%j"),
        ("DD", "%d"),
        ("Do", "%-d"),
        ("D", "%-d"),
        ("dddd", "%A"),
        ("ddd", "%a"),
        ("d", "%w"),
        ("HH", "%H"),
        ("H", "%-H"),
        ("hh", "%I"),
        ("h", "%-I"),
        ("mm", "%M"),
        ("m", "%-M"),
        ("ss", "%S"),
        ("s", "%-S"),
        ("SSS", "%3f"),
        ("A", "%p"),
        ("a", "%P"),
        ("ZZ", "%z"),
        ("Z", "%:z"),
        ("X", "%s"),
        ("ww", "%V"),
        ("W", "%-V"),
    ];

    let mut out = String::new();
    let mut rest = format;
    'outer: while !rest.is_empty() {
        if let Some(inner) = rest.strip_prefix('[') {
            let end = inner.find(']').unwrap_or(inner.len());
            out.push_str(&inner[..end].replace('%', "%%"));
            rest = inner.get(end + 1..).unwrap_or("");
            continue;
        }
        for (token, spec) in TOKENS {
            if let Some(after) = rest.strip_prefix(token) {
                out.push_str(spec);
                rest = after;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }
    out
}

/// `[[target]]` or `[[target|alias]]`, without a trailing `.md`.
pub fn markdown_link(target: &str, alias: Option<&str>) -> String {
    let target = target.strip_suffix(".md").unwrap_or(target);
    match alias.filter(|a| !a.is_empty()) {
        Some(alias) => format!("[[{target}|{alias}]]"),
        None => format!("[[{target}]]"),
    }
}

const STOPWORDS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "of", "to", "is", "in", "that", "it", "with", "for"]),
    ("fr", &["le", "la", "les", "et", "des", "est", "une", "dans", "pour", "que"]),
    ("de", &["der", "die", "das", "und", "ist", "nicht", "ein", "mit", "zu", "den"]),
    ("es", &["el", "los", "las", "y", "es", "una", "por", "con", "para", "que"]),
    ("it", &["il", "gli", "e", "di", "che", "una", "per", "non", "sono", "della"]),
    ("pt", &["o", "os", "as", "e", "do", "da", "uma", "com", "para", "não"]),
    ("nl", &["de", "het", "een", "en", "van", "is", "niet", "dat", "met", "voor"]),
];

/// Best-effort ISO 639-1 code for `text`, or `"unknown"`.
pub fn detect_language(text: &str) -> &'static str {
    let mut counts: [(&str, usize); 10] = [
        ("ru", 0),
        ("el", 0),
        ("ar", 0),
        ("he", 0),
        ("ja", 0),
        ("zh", 0),
        ("ko", 0),
        ("th", 0),
        ("hi", 0),
        ("latin", 0),
    ];
    let mut ukrainian = false;
    for c in text.chars() {
        let slot = match c as u32 {
            0x0400..=0x04FF => {
                ukrainian |= matches!(c, 'і' | 'ї' | 'є' | 'ґ' | 'І' | 'Ї' | 'Є' | 'Ґ');
                0
            }
            0x0370..=0x03FF => 1,
            0x0600..=0x06FF => 2,
            0x0590..=0x05FF => 3,
            0x3040..=0x30FF => 4,
            0x4E00..=0x9FFF => 5,
            0xAC00..=0xD7AF | 0x1100..=0x11FF => 6,
            0x0E00..=0x0E7F => 7,
            0x0900..=0x097F => 8,
            _ if c.is_alphabetic() => 9,
            _ => continue,
        };
        counts[slot].1 += 1;
    }

    // Kana anywhere means Japanese even when kanji dominate.
    if counts[4].1 > 0 {
        return "ja";
    }
    let Some(&(script, n)) = counts.iter().max_by_key(|(_, n)| *n) else {
        return "unknown";
    };
    if n == 0 {
        return "unknown";
    }
    match script {
        "ru" if ukrainian => "uk",
        "latin" => detect_latin(text),
        other => other,
    }
}

fn detect_latin(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();
    let mut best = ("unknown", 0usize);
    for (code, stopwords) in STOPWORDS {
        let hits = words.iter().filter(|w| stopwords.contains(*w)).count();
        if hits > best.1 {
            best = (*code, hits);
        }
    }
    best.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed() -> ChronoTemplating {
        let now = Local.with_ymd_and_hms(2024, 3, 1, 9, 5, 0).unwrap();
        ChronoTemplating::with_clock(now)
    }

    #[test]
    fn moment_tokens() {
        assert_eq!(moment_to_chrono("YYYY-MM-DD"), "%Y-%m-%d");
        assert_eq!(moment_to_chrono("dddd, MMMM D"), "%A, %B %-d");
        assert_eq!(moment_to_chrono("[Week] ww"), "Week %V");
        assert_eq!(moment_to_chrono("HH:mm 100%"), "%H:%M 100%%");
    }

    #[test]
    fn relative_days() {
        let t = fixed();
        assert_eq!(t.now(None), "2024-03-01");
        assert_eq!(t.tomorrow(None), "2024-03-02");
        assert_eq!(t.yesterday(Some("DD/MM/YYYY")), "29/02/2024");
        assert_eq!(t.now(Some("YYYY-MM-DD HH:mm")), "2024-03-01 09:05");
    }

    #[tokio::test]
    async fn prompt_returns_default() {
        let t = fixed();
        let answer = TemplatingPlugin::prompt(&t, "Author?", "anon").await.unwrap();
        assert_eq!(answer, "anon");
    }

    #[test]
    fn links() {
        assert_eq!(markdown_link("Books/Dune.md", None), "[[Books/Dune]]");
        assert_eq!(markdown_link("Dune", Some("the book")), "[[Dune|the book]]");
        assert_eq!(markdown_link("Dune", Some("")), "[[Dune]]");
    }

    #[test]
    fn languages() {
        assert_eq!(detect_language("The cat sat on the mat with the hat"), "en");
        assert_eq!(detect_language("Le chat est dans la maison et les enfants"), "fr");
        assert_eq!(detect_language("Der Hund ist nicht in dem Haus und die Katze"), "de");
        assert_eq!(detect_language("Привет, как дела?"), "ru");
        assert_eq!(detect_language("Привіт, як справи? Її немає"), "uk");
        assert_eq!(detect_language("これは日本語です"), "ja");
        assert_eq!(detect_language("这是中文"), "zh");
        assert_eq!(detect_language("12345 !!"), "unknown");
    }
}
