use crate::listing::models::SourceListing;
use std::collections::HashSet;

const LENGTH_CODE_TO_CM: &[(&str, f64)] = &[
    ("CMT", 1.0),
    ("MMT", 0.1),
    ("MTR", 100.0),
    ("INH", 2.54),
    ("FT", 30.48),
];

const DEFAULT_LENGTH_CODE: &str = "CMT";
const MAX_AXES: usize = 3;

/// A parsed physical size, axes in centimetres sorted largest first so that
/// "30 x 20" and "20 x 30" compare equal.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimensions {
    axes_cm: Vec<f64>,
}

impl Dimensions {
    #[cfg(test)]
    pub fn axes_cm(&self) -> &[f64] {
        &self.axes_cm
    }

    /// Same number of axes, and every axis within `tolerance` (relative to the larger value).
    pub fn agrees_with(&self, other: &Dimensions, tolerance: f64) -> bool {
        self.axes_cm.len() == other.axes_cm.len()
            && self
                .axes_cm
                .iter()
                .zip(&other.axes_cm)
                .all(|(a, b)| (a - b).abs() <= tolerance * a.max(*b))
    }
}

#[derive(Debug)]
enum Token {
    Number(f64),
    Unit(&'static str),
    /// Weight, count or percentage; the number before it is not a length.
    Quantity,
    Of,
}

/// Parse free-text marketplace dimensions such as `30 x 20 x 10 cm`, `12in x 8in` or
/// `L 70cm, W 40cm`. Numbers without their own unit take the next unit in the text, then the
/// previous one, then centimetres. Weights, piece counts and `pack of 2` style counts are
/// skipped.
pub fn parse_dimensions(raw: &str) -> Option<Dimensions> {
    let tokens = tokenize(raw);
    let mut values: Vec<(f64, Option<&'static str>)> = Vec::new();
    for (pos, token) in tokens.iter().enumerate() {
        let Token::Number(value) = token else {
            continue;
        };
        if pos > 0 && matches!(tokens[pos - 1], Token::Of) {
            continue;
        }
        let unit = match tokens.get(pos + 1) {
            Some(Token::Unit(code)) => Some(*code),
            Some(Token::Quantity) => continue,
            _ => None,
        };
        values.push((*value, unit));
    }
    if values.is_empty() {
        return None;
    }

    let units: Vec<Option<&'static str>> = values.iter().map(|(_, unit)| *unit).collect();
    let mut axes_cm = Vec::new();
    for (idx, (value, unit)) in values.iter().enumerate() {
        if *value <= 0.0 {
            continue;
        }
        let code = unit
            .or_else(|| units[idx..].iter().flatten().next().copied())
            .or_else(|| units[..idx].iter().rev().flatten().next().copied())
            .unwrap_or(DEFAULT_LENGTH_CODE);
        let factor = LENGTH_CODE_TO_CM
            .iter()
            .find(|(key, _)| *key == code)
            .map(|(_, factor)| *factor)?;
        axes_cm.push(value * factor);
        if axes_cm.len() == MAX_AXES {
            break;
        }
    }
    if axes_cm.is_empty() {
        return None;
    }
    axes_cm.sort_by(|a, b| b.total_cmp(a));
    Some(Dimensions { axes_cm })
}

fn tokenize(raw: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = raw.chars().collect();
    let mut idx = 0;
    while idx < chars.len() {
        let ch = chars[idx];
        if ch.is_ascii_digit() {
            let start = idx;
            while idx < chars.len()
                && (chars[idx].is_ascii_digit()
                    || (chars[idx] == '.' && chars.get(idx + 1).is_some_and(char::is_ascii_digit)))
            {
                idx += 1;
            }
            let text: String = chars[start..idx].iter().collect();
            if let Ok(value) = text.parse::<f64>() {
                tokens.push(Token::Number(value));
            }
        } else if ch.is_alphabetic() {
            let start = idx;
            while idx < chars.len() && chars[idx].is_alphabetic() {
                idx += 1;
            }
            let word: String = chars[start..idx].iter().collect();
            if let Some(code) = normalize_length_unit(&word) {
                tokens.push(Token::Unit(code));
            } else if is_quantity_word(&word) {
                tokens.push(Token::Quantity);
            } else if word.eq_ignore_ascii_case("of") {
                tokens.push(Token::Of);
            }
        } else {
            match ch {
                '"' | '″' => tokens.push(Token::Unit("INH")),
                '\'' | '′' => tokens.push(Token::Unit("FT")),
                '%' => tokens.push(Token::Quantity),
                _ => {}
            }
            idx += 1;
        }
    }
    tokens
}

fn normalize_length_unit(word: &str) -> Option<&'static str> {
    match word.trim().to_lowercase().as_str() {
        "cm" | "cms" | "centimeter" | "centimeters" | "centimetre" | "centimetres" => Some("CMT"),
        "mm" | "millimeter" | "millimeters" | "millimetre" | "millimetres" => Some("MMT"),
        "m" | "meter" | "meters" | "metre" | "metres" => Some("MTR"),
        "in" | "inch" | "inches" => Some("INH"),
        "ft" | "foot" | "feet" => Some("FT"),
        _ => None,
    }
}

fn is_quantity_word(word: &str) -> bool {
    matches!(
        word.to_lowercase().as_str(),
        "g" | "gm" | "gms" | "gram" | "grams" | "gsm"
            | "kg" | "kgs" | "kilogram" | "kilograms"
            | "lb" | "lbs" | "oz" | "ml"
            | "pc" | "pcs" | "piece" | "pieces"
            | "pack" | "packs" | "set" | "sets"
    )
}

/// Numeric value of a display price such as `₹1,299.00`, `Rs. 499` or `$20 - $25`
/// (first figure wins).
pub fn parse_price(raw: &str) -> Option<f64> {
    let start = raw.find(|ch: char| ch.is_ascii_digit())?;
    let mut digits = String::new();
    let mut chars = raw[start..].chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '0'..='9' => digits.push(ch),
            ',' => {}
            '.' if chars.peek().is_some_and(char::is_ascii_digit) && !digits.contains('.') => {
                digits.push('.')
            }
            _ => break,
        }
    }
    digits
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value > 0.0)
}

/// Stable identity for a marketplace name: `Amazon.in`, `www.amazon.in` and `amazon` are the
/// same source.
pub fn platform_key(platform: &str) -> String {
    let lowered = platform.trim().to_lowercase();
    let stripped = lowered
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.");
    stripped
        .split(|ch: char| !ch.is_alphanumeric())
        .find(|part| !part.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionConsensus {
    pub confirmed: Option<String>,
    pub source_count: u32,
}

/// Pick the dimension reading backed by the most distinct platforms. Ties go to the reading
/// discovered first.
pub fn dimension_consensus(listings: &[SourceListing], tolerance: f64) -> DimensionConsensus {
    let readings: Vec<(String, &str, Dimensions)> = listings
        .iter()
        .filter_map(|listing| {
            let raw = listing.dimensions.as_deref()?.trim();
            let parsed = parse_dimensions(raw)?;
            Some((platform_key(&listing.platform), raw, parsed))
        })
        .collect();

    let mut best: Option<(usize, &str)> = None;
    for (_, raw, candidate) in &readings {
        let backers: HashSet<&str> = readings
            .iter()
            .filter(|(_, _, other)| candidate.agrees_with(other, tolerance))
            .map(|(key, _, _)| key.as_str())
            .filter(|key| !key.is_empty())
            .collect();
        if best.is_none_or(|(count, _)| backers.len() > count) {
            best = Some((backers.len(), *raw));
        }
    }

    match best {
        Some((count, raw)) if count > 0 => DimensionConsensus {
            confirmed: Some(raw.to_string()),
            source_count: count as u32,
        },
        _ => DimensionConsensus {
            confirmed: None,
            source_count: 0,
        },
    }
}
