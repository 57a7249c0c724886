/// Keyword-anchored value extraction from free-form command output.
///
/// Each line is tested against the keywords in priority order. The first
/// keyword that matches wins, and the text after the end of the match is
/// classified as a percentage, a number, or an opaque string.
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A typed value pulled out of one line of output.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedValue {
    /// A percentage, stored as a fraction (`42%` -> 0.42).
    Fraction(f64),
    Number(f64),
    Raw(String),
}

impl ExtractedValue {
    /// Text form used for table cells.
    pub fn to_cell(&self) -> String {
        match self {
            ExtractedValue::Fraction(v) | ExtractedValue::Number(v) => v.to_string(),
            ExtractedValue::Raw(s) => s.clone(),
        }
    }
}

/// How configured keywords are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMode {
    /// Keywords are regular expressions.
    #[default]
    Regex,
    /// Keywords are matched as plain substrings.
    Literal,
}

/// A percentage that could not be parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    /// 1-based line number within the command output.
    pub line: usize,
    pub content: String,
    pub reason: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: invalid percentage {:?}: {}",
            self.line, self.content, self.reason
        )
    }
}

impl std::error::Error for DecodeError {}

/// Compiled keyword set.
#[derive(Debug, Clone)]
pub struct KeywordExtractor {
    patterns: Vec<Regex>,
}

impl KeywordExtractor {
    /// Compile `keywords` in priority order.
    pub fn new<S: AsRef<str>>(keywords: &[S], mode: KeywordMode) -> Result<Self, regex::Error> {
        let patterns = keywords
            .iter()
            .map(|k| match mode {
                KeywordMode::Regex => Regex::new(k.as_ref()),
                KeywordMode::Literal => Regex::new(&regex::escape(k.as_ref())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Extract one value per matching line, in line order.
    pub fn extract(&self, text: &str) -> Result<Vec<ExtractedValue>, DecodeError> {
        let mut values = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let Some(rest) = self.match_tail(line) else {
                continue;
            };
            let value = classify(&unquote(rest)).map_err(|reason| DecodeError {
                line: idx + 1,
                content: line.trim().to_string(),
                reason,
            })?;
            values.push(value);
        }
        Ok(values)
    }

    /// Text after the first matching keyword, or None.
    fn match_tail<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.patterns
            .iter()
            .find_map(|p| p.find(line))
            .map(|m| &line[m.end()..])
    }
}

/// Trim whitespace and a single layer of double quotes.
fn unquote(s: &str) -> String {
    let s = s.trim();
    let s = s.strip_prefix('"').unwrap_or(s);
    let s = s.strip_suffix('"').unwrap_or(s);
    s.trim().to_string()
}

fn classify(content: &str) -> Result<ExtractedValue, String> {
    if let Some(number) = content.strip_suffix('%') {
        return number
            .trim()
            .parse::<f64>()
            .map(|v| ExtractedValue::Fraction(v / 100.0))
            .map_err(|e| e.to_string());
    }
    Ok(match content.parse::<f64>() {
        Ok(v) => ExtractedValue::Number(v),
        Err(_) => ExtractedValue::Raw(content.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(keywords: &[&str]) -> KeywordExtractor {
        KeywordExtractor::new(keywords, KeywordMode::Regex).unwrap()
    }

    #[test]
    fn test_percentage_becomes_fraction() {
        let values = extractor(&["Used:"]).extract("Used: 42%").unwrap();
        assert_eq!(values, vec![ExtractedValue::Fraction(0.42)]);
    }

    #[test]
    fn test_plain_number() {
        let values = extractor(&["Load:"]).extract("Load: 3.5").unwrap();
        assert_eq!(values, vec![ExtractedValue::Number(3.5)]);
    }

    #[test]
    fn test_unparseable_kept_raw() {
        let values = extractor(&["Version:"]).extract("Version: abc").unwrap();
        assert_eq!(values, vec![ExtractedValue::Raw("abc".to_string())]);
    }

    #[test]
    fn test_bad_percentage_is_error() {
        let err = extractor(&["Used:"])
            .extract("header\nUsed: lots%\n")
            .unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.content, "Used: lots%");
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_only_one_percent_sign_stripped() {
        let err = extractor(&["Used:"]).extract("Used: 42%%").unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.content, "Used: 42%%");
    }

    #[test]
    fn test_percent_not_trailing_is_raw() {
        let values = extractor(&["CPU:"]).extract("CPU: 50% busy").unwrap();
        assert_eq!(values, vec![ExtractedValue::Raw("50% busy".to_string())]);
    }

    #[test]
    fn test_content_taken_after_match_end() {
        let values = extractor(&["temp="]).extract("sensor temp=  71.5  ").unwrap();
        assert_eq!(values, vec![ExtractedValue::Number(71.5)]);
    }

    #[test]
    fn test_one_layer_of_quotes_removed() {
        let values = extractor(&["name:"])
            .extract("name: \"\"router-1\"\"\nname: \" 15% \"")
            .unwrap();
        assert_eq!(
            values,
            vec![
                ExtractedValue::Raw("\"router-1\"".to_string()),
                ExtractedValue::Fraction(0.15),
            ]
        );
    }

    #[test]
    fn test_first_keyword_wins_per_line() {
        let ex = extractor(&["A:", "B:"]);
        let values = ex.extract("B: 2 A: 1").unwrap();
        // "A:" has priority, so content after "A:" is used
        assert_eq!(values, vec![ExtractedValue::Number(1.0)]);
    }

    #[test]
    fn test_output_follows_line_order_not_keyword_order() {
        let ex = extractor(&["first:", "second:"]);
        let values = ex.extract("second: 2\nnoise\nfirst: 1\nsecond: x").unwrap();
        assert_eq!(
            values,
            vec![
                ExtractedValue::Number(2.0),
                ExtractedValue::Number(1.0),
                ExtractedValue::Raw("x".to_string()),
            ]
        );
    }

    #[test]
    fn test_no_match_yields_nothing() {
        let values = extractor(&["Used:"]).extract("nothing here\n\n").unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_empty_tail_is_raw_empty_string() {
        let values = extractor(&["Used:"]).extract("Used:   ").unwrap();
        assert_eq!(values, vec![ExtractedValue::Raw(String::new())]);
    }

    #[test]
    fn test_regex_keywords() {
        let values = extractor(&[r"Mem\w*:"]).extract("MemTotal: 1024\r\n").unwrap();
        assert_eq!(values, vec![ExtractedValue::Number(1024.0)]);
    }

    #[test]
    fn test_literal_mode_escapes_metacharacters() {
        let ex = KeywordExtractor::new(&["usage(%)"], KeywordMode::Literal).unwrap();
        let values = ex.extract("disk usage(%) 88").unwrap();
        assert_eq!(values, vec![ExtractedValue::Number(88.0)]);
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(KeywordExtractor::new(&["(unclosed"], KeywordMode::Regex).is_err());
    }

    #[test]
    fn test_to_cell_rendering() {
        assert_eq!(ExtractedValue::Fraction(0.73).to_cell(), "0.73");
        assert_eq!(ExtractedValue::Number(3.5).to_cell(), "3.5");
        assert_eq!(ExtractedValue::Number(12.0).to_cell(), "12");
        assert_eq!(ExtractedValue::Raw("up".to_string()).to_cell(), "up");
    }
}
