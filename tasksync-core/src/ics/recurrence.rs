//! RRULE normalization and the repeat-from-completion rule part.
//!
//! The flag travels as the x-name rule part `X-FROM=COMPLETION`, which
//! other clients ignore. Decoding also accepts the bare `FROM=` spelling.

use crate::model::Recurrence;

const FROM_COMPLETION_PART: &str = "X-FROM=COMPLETION";

const FREQUENCIES: [&str; 7] = [
    "SECONDLY", "MINUTELY", "HOURLY", "DAILY", "WEEKLY", "MONTHLY", "YEARLY",
];

/// Upper-case the rule, drop an `RRULE:` prefix, empty parts and `COUNT=-1`.
pub fn canonicalize(rule: &str) -> String {
    let rule = rule.trim();
    let rule = rule
        .strip_prefix("RRULE:")
        .or_else(|| rule.strip_prefix("rrule:"))
        .unwrap_or(rule);

    rule.split(';')
        .map(|part| part.trim().to_uppercase())
        .filter(|part| !part.is_empty() && part != "COUNT=-1")
        .collect::<Vec<_>>()
        .join(";")
}

/// Split a wire RRULE into the canonical rule and the completion flag.
///
/// Returns `None` for rules without a valid FREQ part.
pub fn decode(raw: &str) -> Option<Recurrence> {
    let canonical = canonicalize(raw);
    let mut from_completion = false;
    let parts: Vec<&str> = canonical
        .split(';')
        .filter(|part| {
            let from = part
                .strip_prefix("X-FROM=")
                .or_else(|| part.strip_prefix("FROM="));
            match from {
                Some(value) => {
                    from_completion = value == "COMPLETION";
                    false
                }
                None => true,
            }
        })
        .collect();

    let freq = parts.iter().find_map(|p| p.strip_prefix("FREQ="));
    match freq {
        Some(freq) if FREQUENCIES.contains(&freq) => Some(Recurrence {
            rule: parts.join(";"),
            from_completion,
        }),
        _ => {
            log::warn!("Ignoring recurrence without a valid FREQ: {}", raw);
            None
        }
    }
}

/// Render the rule for the wire, embedding the completion flag.
pub fn encode(recurrence: &Recurrence) -> String {
    let rule = canonicalize(&recurrence.rule);
    let rule: Vec<&str> = rule
        .split(';')
        .filter(|p| !p.starts_with("FROM=") && !p.starts_with("X-FROM="))
        .collect();
    let mut rule = rule.join(";");
    if recurrence.from_completion {
        rule.push(';');
        rule.push_str(FROM_COMPLETION_PART);
    }
    rule
}
