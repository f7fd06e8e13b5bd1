//! PII detection and masking for everything that crosses an I/O boundary.
//!
//! Patterns covered: card numbers (13-19 consecutive digits), email
//! addresses, US SSNs and Aadhaar numbers. Values under any key whose
//! lowercased name contains `pan` are masked wholesale, whatever their type.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

pub const PAN_MASK: &str = "****REDACTED****";
pub const SSN_MASK: &str = "***-**-****";
pub const AADHAAR_MASK: &str = "**** **** ****";

static PAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{13,19}").expect("pan pattern"));
static SSN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern"));
static AADHAAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4} \d{4} \d{4}\b").expect("aadhaar pattern"));
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9._%+-]+)@([A-Za-z0-9.-]+\.[A-Za-z]{2,})").expect("email pattern")
});

/// Redaction outcome: the rewritten value plus whether anything was masked.
#[derive(Debug, Clone, PartialEq)]
pub struct Redacted<T> {
    pub value: T,
    pub masked: bool,
}

pub fn redact_text(input: &str) -> Redacted<String> {
    let mut masked = false;

    let pass = PAN_RE.replace_all(input, PAN_MASK);
    if let std::borrow::Cow::Owned(_) = pass {
        masked = true;
    }
    let text = pass.into_owned();

    let pass = AADHAAR_RE.replace_all(&text, AADHAAR_MASK);
    if let std::borrow::Cow::Owned(_) = pass {
        masked = true;
    }
    let text = pass.into_owned();

    let pass = SSN_RE.replace_all(&text, SSN_MASK);
    if let std::borrow::Cow::Owned(_) = pass {
        masked = true;
    }
    let text = pass.into_owned();

    let pass = EMAIL_RE.replace_all(&text, |caps: &regex::Captures<'_>| {
        let local = &caps[1];
        let keep = local.chars().take(2).collect::<String>();
        format!("{}***@{}", keep, &caps[2])
    });
    if let std::borrow::Cow::Owned(_) = pass {
        masked = true;
    }

    Redacted {
        value: pass.into_owned(),
        masked,
    }
}

pub fn mask_email(email: &str) -> String {
    redact_text(email).value
}

/// Walk a JSON tree, masking strings in place. A key whose lowercased name
/// contains `pan` has its whole value replaced. Numbers are inspected via
/// their decimal form so a card number stored as an integer is still caught.
pub fn redact_value(value: &Value) -> Redacted<Value> {
    let mut masked = false;
    let value = walk(value, &mut masked);
    Redacted { value, masked }
}

fn walk(value: &Value, masked: &mut bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, entry) in map {
                if key.to_lowercase().contains("pan") {
                    *masked = true;
                    out.insert(key.clone(), Value::String(PAN_MASK.to_string()));
                } else {
                    out.insert(key.clone(), walk(entry, masked));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| walk(item, masked)).collect())
        }
        Value::String(text) => {
            let redacted = redact_text(text);
            if redacted.masked {
                *masked = true;
            }
            Value::String(redacted.value)
        }
        Value::Number(number) => {
            let digits = number.to_string();
            if (13..=19).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit()) {
                *masked = true;
                Value::String(PAN_MASK.to_string())
            } else {
                value.clone()
            }
        }
        Value::Bool(_) | Value::Null => value.clone(),
    }
}
