//! PICA+ line tokenizer
//!
//! A record line starts with the record separator, followed by the field code
//! and sub-fields. Sub-fields are introduced by the unit separator, or by `$`
//! when the unit separator is missing and the next character is a known
//! sub-field code.

// ============================================================================
// Delimiters
// ============================================================================

pub const DELIMITER_OBJ: char = '\u{1d}';
pub const DELIMITER_REC: char = '\u{1e}';
pub const DELIMITER_VAL: char = '\u{1f}';
pub const DELIMITER_FALLBACK: char = '$';

pub const KNOWN_SUB_FIELDS: &[char] = &[
    '0', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'A', 'b', 'B', 'c', 'C', 'd', 'e', 'f',
    'g', 'h', 'i', 'j', 'k', 'l', 'L', 'm', 'n', 'N', 'o', 'p', 'P', 'q', 'r', 'S', 's', 't',
    'T', 'U', 'u', 'v', 'w', 'X', 'x', 'y', 'z',
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Start of a new item
    Object,
    /// Field code followed by raw sub-field parts (`"a<value>"`)
    Record { field: String, parts: Vec<String> },
    /// Anything else (blank lines, headers)
    Other,
}

pub fn is_known_sub_field(c: char) -> bool {
    KNOWN_SUB_FIELDS.contains(&c)
}

pub fn parse_line(line: &str) -> Line {
    let mut chars = line.chars();
    match chars.next() {
        Some(DELIMITER_OBJ) => return Line::Object,
        Some(DELIMITER_REC) => {},
        _ => return Line::Other,
    }

    let body: Vec<char> = chars.as_str().trim_end_matches(['\n', '\r']).chars().collect();
    let mut parts: Vec<String> = Vec::new();
    let mut part = String::new();

    for (i, &c) in body.iter().enumerate() {
        if c == DELIMITER_VAL {
            if !part.is_empty() {
                parts.push(part.trim().to_string());
                part.clear();
            }
            continue;
        }
        // `$` at the very end has no sub-field code and stays literal
        if c == DELIMITER_FALLBACK && i + 1 < body.len() && is_known_sub_field(body[i + 1]) {
            parts.push(part.trim().to_string());
            part.clear();
            continue;
        }
        part.push(c);
    }
    if !part.is_empty() {
        parts.push(part.trim().to_string());
    }

    let mut parts = parts.into_iter();
    match parts.next() {
        Some(field) if !field.is_empty() => Line::Record {
            field,
            parts: parts.collect(),
        },
        _ => Line::Other,
    }
}

/// Group sub-field parts by their code, in order of first appearance
///
/// Parts shorter than two characters carry no value and are dropped.
pub fn group_line(parts: &[String]) -> Vec<(String, Vec<String>)> {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for part in parts {
        let mut chars = part.chars();
        let Some(code) = chars.next() else { continue };
        let value = chars.as_str();
        if value.is_empty() {
            continue;
        }
        let code = code.to_string();
        match groups.iter_mut().find(|(c, _)| *c == code) {
            Some((_, values)) => values.push(value.to_string()),
            None => groups.push((code, vec![value.to_string()])),
        }
    }
    groups
}
