//! Numeric extraction from raw sensor fields.
//!
//! Controllers emit a mix of numbers, annotated strings like
//! `"23.2 °C {ok}"`, and categorical states. Numbers pass through, known
//! categorical states go through the versioned mapping table, and anything
//! else is flagged for the caller to log — an unmapped field is a signal a
//! new firmware rolled out, not something to drop silently.

use serde_json::Value;

/// Bumped whenever an entry is added or changed, so stored points can be
/// traced to the mapping that produced them.
pub const FIELD_MAP_VERSION: u32 = 2;

/// Categorical state → numeric encoding.
const STRING_MAP: &[(&str, f64)] = &[
    ("occupied", 1.0),
    ("unoccupied", 0.0),
    ("on", 1.0),
    ("off", 0.0),
    ("enabled", 1.0),
    ("disabled", 0.0),
    ("true", 1.0),
    ("false", 0.0),
    ("open", 1.0),
    ("closed", 0.0),
];

#[derive(Debug, Default)]
pub struct Extraction {
    /// (field name, numeric value) pairs ready to persist.
    pub values: Vec<(String, f64)>,
    /// Fields that mapped to nothing.
    pub unmapped: Vec<String>,
}

/// Extract numeric values from one sensor's field map.
pub fn extract_fields<'a>(
    fields: impl IntoIterator<Item = (&'a String, &'a Value)>,
) -> Extraction {
    let mut extraction = Extraction::default();
    for (name, value) in fields {
        match numeric_value(value) {
            Some(v) => extraction.values.push((name.clone(), v)),
            None => extraction.unmapped.push(name.clone()),
        }
    }
    extraction
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => string_value(s),
        _ => None,
    }
}

fn string_value(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();

    // Annotated readings carry a leading number: "23.2 °C {ok}".
    let prefix: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if !prefix.is_empty() {
        if let Ok(v) = prefix.parse::<f64>() {
            if v.is_finite() {
                return Some(v);
            }
        }
    }

    let lowered = trimmed.to_lowercase();
    STRING_MAP
        .iter()
        .find(|(state, _)| *state == lowered)
        .map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn run(pairs: &[(&str, Value)]) -> Extraction {
        let map: BTreeMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        extract_fields(map.iter())
    }

    #[test]
    fn numbers_pass_through() {
        let ex = run(&[("Return_Air_Temp", serde_json::json!(22.4))]);
        assert_eq!(ex.values, vec![("Return_Air_Temp".to_string(), 22.4)]);
        assert!(ex.unmapped.is_empty());
    }

    #[test]
    fn annotated_readings_yield_their_leading_number() {
        let ex = run(&[("nvoSpaceTemp", serde_json::json!("23.2 °C {ok}"))]);
        assert_eq!(ex.values, vec![("nvoSpaceTemp".to_string(), 23.2)]);
    }

    #[test]
    fn categorical_states_map_through_the_table() {
        let ex = run(&[
            ("Occupation_Status", serde_json::json!("Occupied")),
            ("Fan_Status", serde_json::json!("off")),
        ]);
        let mut values = ex.values;
        values.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            values,
            vec![
                ("Fan_Status".to_string(), 0.0),
                ("Occupation_Status".to_string(), 1.0),
            ]
        );
    }

    #[test]
    fn unknown_strings_are_flagged_not_dropped() {
        let ex = run(&[("H_O_A", serde_json::json!("Hand"))]);
        assert!(ex.values.is_empty());
        assert_eq!(ex.unmapped, vec!["H_O_A".to_string()]);
    }

    #[test]
    fn nan_text_is_flagged() {
        let ex = run(&[("nvoSupplyTemp", serde_json::json!("nan °C {fault}"))]);
        assert!(ex.values.is_empty());
        assert_eq!(ex.unmapped, vec!["nvoSupplyTemp".to_string()]);
    }
}
