// PII detection and redaction over strings and nested argument trees

use crate::core::errors::ShieldError;
use crate::core::models::{CustomPiiPattern, PIIMatch, PIIType};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

/// Configuration for [`PIIDetector`].
#[derive(Debug, Clone)]
pub struct PiiDetectorConfig {
    /// Luhn-validate credit card candidates for a lower false-positive rate
    pub luhn_check: bool,
}

impl Default for PiiDetectorConfig {
    fn default() -> Self {
        Self { luhn_check: true }
    }
}

type Validator = fn(&str) -> bool;
type Masker = fn(&str) -> String;

struct Detector {
    pii_type: PIIType,
    regex: Regex,
    validator: Option<Validator>,
    masker: Masker,
}

/// Typed PII detector. Each detector is a `(type, pattern, masker)` tuple;
/// validator-bearing detectors post-check candidates (IP octets, Luhn, INN
/// checksum) to keep false positives down.
pub struct PIIDetector {
    detectors: Vec<Detector>,
}

impl Default for PIIDetector {
    fn default() -> Self {
        Self::new(PiiDetectorConfig::default())
    }
}

impl PIIDetector {
    pub fn new(config: PiiDetectorConfig) -> Self {
        let mut detectors = Vec::new();

        let mut add = |pii_type: PIIType, pattern: &str, validator: Option<Validator>, masker: Masker| {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(matches!(pii_type, PIIType::DateOfBirth))
                .build()
                .unwrap_or_else(|e| panic!("built-in PII pattern for {:?} invalid: {}", pii_type, e));
            detectors.push(Detector {
                pii_type,
                regex,
                validator,
                masker,
            });
        };

        add(
            PIIType::Email,
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            None,
            mask_email,
        );
        add(
            PIIType::CreditCard,
            r"\b(?:\d[ \-]?){12,18}\d\b",
            if config.luhn_check { Some(luhn_valid) } else { Some(card_length_valid) },
            mask_card,
        );
        add(
            PIIType::Ssn,
            r"\b\d{3}-\d{2}-\d{4}\b",
            None,
            mask_digits,
        );
        add(
            PIIType::Iban,
            r"\b[A-Z]{2}\d{2}[A-Za-z0-9]{11,30}\b",
            None,
            mask_generic,
        );
        add(
            PIIType::IpAddress,
            r"\b(?:\d{1,3}\.){3}\d{1,3}\b",
            Some(ip_octets_valid),
            mask_digits,
        );
        // Letter prefix then 7-9 digits, excluding short product codes
        add(
            PIIType::Passport,
            r"\b[A-Z]{1,2}\d{7,9}\b",
            None,
            mask_generic,
        );
        add(
            PIIType::DateOfBirth,
            r"\b(?:dob|date of birth|birth ?date|born)[:\s]+\d{1,2}[./-]\d{1,2}[./-]\d{2,4}\b",
            None,
            mask_digits,
        );
        add(
            PIIType::RuPhone,
            r"(?:\+7|\b8)[ \-]?\(?\d{3}\)?[ \-]?\d{3}[ \-]?\d{2}[ \-]?\d{2}\b",
            None,
            mask_digits,
        );
        add(
            PIIType::Phone,
            r"\+\d{1,3}[ \-.]?\(?\d{2,4}\)?[ \-.]?\d{2,4}[ \-.]?\d{2,4}|\b\(?\d{3}\)?[ \-.]\d{3}[ \-.]\d{4}\b",
            None,
            mask_digits,
        );
        add(
            PIIType::Snils,
            r"\b\d{3}-\d{3}-\d{3}[ \-]?\d{2}\b",
            None,
            mask_digits,
        );
        add(PIIType::RuPassport, r"\b\d{4} \d{6}\b", None, mask_digits);
        add(
            PIIType::Inn,
            r"\b\d{10}(?:\d{2})?\b",
            Some(inn_checksum_valid),
            mask_digits,
        );

        Self { detectors }
    }

    /// Add custom patterns from the rule file, compiled as `PIIType::Custom`.
    pub fn with_custom_patterns(
        mut self,
        patterns: &[CustomPiiPattern],
    ) -> Result<Self, ShieldError> {
        for custom in patterns {
            let regex = Regex::new(&custom.pattern).map_err(|e| {
                ShieldError::Configuration(format!(
                    "Invalid custom PII pattern '{}': {}",
                    custom.name, e
                ))
            })?;
            self.detectors.push(Detector {
                pii_type: PIIType::Custom,
                regex,
                validator: None,
                masker: mask_generic,
            });
        }
        Ok(self)
    }

    /// Scan a string. Spans are byte offsets into the original UTF-8 text.
    pub fn scan(&self, text: &str) -> Vec<PIIMatch> {
        self.scan_field(text, "")
    }

    fn scan_field(&self, text: &str, field: &str) -> Vec<PIIMatch> {
        let mut matches: Vec<PIIMatch> = Vec::new();
        for detector in &self.detectors {
            for m in detector.regex.find_iter(text) {
                if let Some(validate) = detector.validator {
                    if !validate(m.as_str()) {
                        continue;
                    }
                }
                matches.push(PIIMatch {
                    pii_type: detector.pii_type,
                    field: field.to_string(),
                    span: (m.start(), m.end()),
                    masked_value: (detector.masker)(m.as_str()),
                });
            }
        }
        // Deterministic order; drop overlapping matches (first detector wins)
        matches.sort_by_key(|m| (m.span.0, usize::MAX - m.span.1));
        let mut kept: Vec<PIIMatch> = Vec::new();
        for m in matches {
            match kept.last() {
                Some(prev) if m.span.0 < prev.span.1 => {}
                _ => kept.push(m),
            }
        }
        kept
    }

    /// Walk a nested structure; `field` paths use dots and `[i]` indices.
    pub fn scan_value(&self, value: &Value) -> Vec<PIIMatch> {
        let mut matches = Vec::new();
        self.walk_scan(value, "", &mut matches);
        matches
    }

    fn walk_scan(&self, value: &Value, path: &str, out: &mut Vec<PIIMatch>) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    let child = if path.is_empty() {
                        k.clone()
                    } else {
                        format!("{}.{}", path, k)
                    };
                    self.walk_scan(v, &child, out);
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.walk_scan(item, &format!("{}[{}]", path, i), out);
                }
            }
            Value::String(s) => out.extend(self.scan_field(s, path)),
            _ => {}
        }
    }

    /// Redact a string: every match replaced by its deterministic mask.
    pub fn redact(&self, text: &str) -> (String, Vec<PIIMatch>) {
        let matches = self.scan_field(text, "");
        let mut redacted = text.to_string();
        for m in matches.iter().rev() {
            redacted.replace_range(m.span.0..m.span.1, &m.masked_value);
        }
        (redacted, matches)
    }

    /// Deep-copy `value` with every matched span replaced; redaction is
    /// complete at every nesting level and idempotent.
    pub fn redact_value(&self, value: &Value) -> (Value, Vec<PIIMatch>) {
        let mut matches = Vec::new();
        let redacted = self.walk_redact(value, "", &mut matches);
        (redacted, matches)
    }

    fn walk_redact(&self, value: &Value, path: &str, out: &mut Vec<PIIMatch>) -> Value {
        match value {
            Value::Object(map) => {
                let mut result = Map::new();
                for (k, v) in map {
                    let child = if path.is_empty() {
                        k.clone()
                    } else {
                        format!("{}.{}", path, k)
                    };
                    result.insert(k.clone(), self.walk_redact(v, &child, out));
                }
                Value::Object(result)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.walk_redact(item, &format!("{}[{}]", path, i), out))
                    .collect(),
            ),
            Value::String(s) => {
                let matches = self.scan_field(s, path);
                let mut redacted = s.clone();
                for m in matches.iter().rev() {
                    redacted.replace_range(m.span.0..m.span.1, &m.masked_value);
                }
                out.extend(matches);
                Value::String(redacted)
            }
            other => other.clone(),
        }
    }
}

// -- validators ---------------------------------------------------------

fn digits_of(text: &str) -> Vec<u32> {
    text.chars().filter_map(|c| c.to_digit(10)).collect()
}

fn card_length_valid(candidate: &str) -> bool {
    let n = digits_of(candidate).len();
    (13..=19).contains(&n)
}

fn luhn_valid(candidate: &str) -> bool {
    let digits = digits_of(candidate);
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let mut sum = 0;
    for (i, d) in digits.iter().rev().enumerate() {
        let mut d = *d;
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

fn ip_octets_valid(candidate: &str) -> bool {
    candidate
        .split('.')
        .all(|octet| octet.parse::<u32>().map(|n| n <= 255).unwrap_or(false))
}

/// Russian INN checksum (10-digit: one check digit; 12-digit: two).
fn inn_checksum_valid(candidate: &str) -> bool {
    let digits = digits_of(candidate);
    let weighted = |coeffs: &[u32], upto: usize| -> u32 {
        coeffs
            .iter()
            .zip(digits.iter().take(upto))
            .map(|(c, d)| c * d)
            .sum::<u32>()
            % 11
            % 10
    };
    match digits.len() {
        10 => weighted(&[2, 4, 10, 3, 5, 9, 4, 6, 8], 9) == digits[9],
        12 => {
            let c11 = weighted(&[7, 2, 4, 10, 3, 5, 9, 4, 6, 8], 10);
            let c12 = weighted(&[3, 7, 2, 4, 10, 3, 5, 9, 4, 6, 8], 11);
            c11 == digits[10] && c12 == digits[11]
        }
        _ => false,
    }
}

// -- maskers ------------------------------------------------------------
//
// Masks are deterministic and keep the textual class of the original so
// redaction never re-triggers a detector.

fn mask_email(text: &str) -> String {
    let Some((local, domain)) = text.split_once('@') else {
        return mask_generic(text);
    };
    let l0 = local.chars().next().unwrap_or('*');
    let (host, tld) = match domain.rsplit_once('.') {
        Some((host, tld)) => (host, tld),
        None => (domain, ""),
    };
    let h0 = host.chars().next().unwrap_or('*');
    if tld.is_empty() {
        format!("{}***@{}***", l0, h0)
    } else {
        format!("{}***@{}***.{}", l0, h0, tld)
    }
}

/// Keep the last four digits, star the rest, preserve separators.
fn mask_card(text: &str) -> String {
    let total_digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    let mut seen = 0;
    text.chars()
        .map(|c| {
            if c.is_ascii_digit() {
                seen += 1;
                if seen + 4 > total_digits {
                    c
                } else {
                    '*'
                }
            } else {
                c
            }
        })
        .collect()
}

/// Star every digit, preserve separators.
fn mask_digits(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_digit() { '*' } else { c })
        .collect()
}

/// Keep the first character, star the remaining alphanumerics.
fn mask_generic(text: &str) -> String {
    text.chars()
        .enumerate()
        .map(|(i, c)| {
            if i > 0 && c.is_alphanumeric() {
                '*'
            } else {
                c
            }
        })
        .collect()
}
