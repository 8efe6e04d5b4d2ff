//! Text extraction and normalization for recognized pages.

use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

static TEXT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:\w+:)?TextLine\b[^>]*?(?:/>|>(.*?)</(?:\w+:)?TextLine>)").unwrap()
});
static STRING_CONTENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<(?:\w+:)?String\b[^>]*?\bCONTENT="([^"]*)""#).unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Marks that end a line broken inside a word.
const HYPHENS: &[char] = &['-', '¬', '⸗', '='];

/// One string per ALTO `TextLine`, words joined by single spaces. Lines
/// without any `String` content are skipped.
pub fn alto_lines(xml: &str) -> Vec<String> {
    TEXT_LINE
        .captures_iter(xml)
        .filter_map(|cap| {
            let body = cap.get(1)?.as_str();
            let words: Vec<String> = STRING_CONTENT
                .captures_iter(body)
                .map(|c| unescape_xml(&c[1]))
                .filter(|w| !w.trim().is_empty())
                .collect();
            (!words.is_empty()).then(|| words.join(" "))
        })
        .collect()
}

/// Joins words split across line ends: `Verwal-` + `tung ist` becomes
/// `Verwaltung` + `ist`. The joined word stays on the earlier line.
pub fn dehyphenate(lines: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut join_next = false;

    for (i, line) in lines.iter().enumerate() {
        let mut current = line.trim().to_string();
        if join_next {
            join_next = false;
            let (first, tail) = split_first_word(&current);
            let tail = tail.to_string();
            if let Some(prev) = out.last_mut() {
                prev.push_str(first);
                // A line holding only a middle fragment passes the break on.
                if tail.is_empty() && i + 1 < lines.len() && ends_with_break(prev) {
                    let kept = prev.trim_end_matches(HYPHENS).len();
                    prev.truncate(kept);
                    join_next = true;
                }
            }
            current = tail;
        }
        if i + 1 < lines.len() && ends_with_break(&current) {
            current = current.trim_end_matches(HYPHENS).to_string();
            join_next = true;
        }
        out.push(current);
    }
    out.retain(|l| !l.is_empty());
    out
}

fn split_first_word(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((first, tail)) => (first, tail.trim_start()),
        None => (line, ""),
    }
}

fn ends_with_break(line: &str) -> bool {
    let mut chars = line.chars().rev();
    match (chars.next(), chars.next()) {
        (Some(last), Some(before)) => HYPHENS.contains(&last) && before.is_alphabetic(),
        _ => false,
    }
}

pub fn strip_chars(s: &str, chars: &str) -> String {
    if chars.is_empty() {
        return s.to_string();
    }
    s.chars().filter(|c| !chars.contains(*c)).collect()
}

pub fn strip_diacritics(s: &str) -> String {
    s.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

/// Scoring input: dehyphenated, stripped, whitespace-collapsed lines.
pub fn normalize_for_scoring(lines: &[String], strip: &str, diacritics: bool) -> Vec<String> {
    dehyphenate(lines)
        .iter()
        .map(|line| {
            let mut l = line.nfc().collect::<String>();
            l = strip_chars(&l, strip);
            if diacritics {
                l = strip_diacritics(&l);
            }
            WHITESPACE.replace_all(l.trim(), " ").into_owned()
        })
        .filter(|l| !l.is_empty())
        .collect()
}

pub fn word_count(lines: &[String]) -> usize {
    lines.iter().map(|l| l.split_whitespace().count()).sum()
}

fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
