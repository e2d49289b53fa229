//! `strategy.matrix` expansion.

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::errors::GraphError;

use super::doc::scalar_string;

/// Upper bound on combinations a single job may expand into.
pub const MAX_COMBINATIONS: usize = 256;

pub type Combination = BTreeMap<String, String>;

/// Expand a matrix into its combinations, axes ordered by name.
///
/// `exclude` entries drop every combination they fully match; `include`
/// entries are appended unless an identical combination already exists.
pub fn expand(job: &str, matrix: &Value) -> Result<Vec<Combination>, GraphError> {
    let invalid = |message: String| GraphError::InvalidMatrix {
        job: job.to_string(),
        message,
    };

    let Value::Mapping(map) = matrix else {
        return Err(invalid("matrix must be a mapping".to_string()));
    };

    let mut axes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for (key, value) in map {
        let key = scalar_string(key);
        match key.as_str() {
            "include" => include = entries(value).map_err(&invalid)?,
            "exclude" => exclude = entries(value).map_err(&invalid)?,
            _ => {
                let Value::Sequence(values) = value else {
                    return Err(invalid(format!("axis '{}' must be a list", key)));
                };
                if values.is_empty() {
                    return Err(invalid(format!("axis '{}' is empty", key)));
                }
                axes.insert(key, values.iter().map(scalar_string).collect());
            }
        }
    }

    let mut combos: Vec<Combination> = if axes.is_empty() {
        Vec::new()
    } else {
        let mut acc = vec![Combination::new()];
        for (axis, values) in &axes {
            let mut next = Vec::with_capacity(acc.len() * values.len());
            for combo in &acc {
                for value in values {
                    let mut c = combo.clone();
                    c.insert(axis.clone(), value.clone());
                    next.push(c);
                }
            }
            if next.len() > MAX_COMBINATIONS {
                return Err(invalid(format!(
                    "expands to more than {} combinations",
                    MAX_COMBINATIONS
                )));
            }
            acc = next;
        }
        acc
    };

    combos.retain(|combo| {
        !exclude
            .iter()
            .any(|ex| ex.iter().all(|(k, v)| combo.get(k) == Some(v)))
    });

    for extra in include {
        if !combos.contains(&extra) {
            combos.push(extra);
        }
    }

    if combos.is_empty() {
        return Err(invalid("matrix produced no combinations".to_string()));
    }
    if combos.len() > MAX_COMBINATIONS {
        return Err(invalid(format!(
            "expands to more than {} combinations",
            MAX_COMBINATIONS
        )));
    }
    Ok(combos)
}

fn entries(value: &Value) -> Result<Vec<Combination>, String> {
    let Value::Sequence(items) = value else {
        return Err("include/exclude must be a list of mappings".to_string());
    };
    items
        .iter()
        .map(|item| match item {
            Value::Mapping(m) => Ok(m
                .iter()
                .map(|(k, v)| (scalar_string(k), scalar_string(v)))
                .collect()),
            _ => Err("include/exclude entries must be mappings".to_string()),
        })
        .collect()
}

/// Deterministic key suffix: `build (ubuntu, 18)`.
pub fn suffixed(base: &str, combo: &Combination) -> String {
    if combo.is_empty() {
        return base.to_string();
    }
    let values: Vec<&str> = combo.values().map(String::as_str).collect();
    format!("{} ({})", base, values.join(", "))
}

/// Replace `${{ matrix.<axis> }}` references with the combination's values.
pub fn substitute(text: &str, combo: &Combination) -> String {
    let mut out = text.to_string();
    for (axis, value) in combo {
        for needle in [
            format!("${{{{ matrix.{} }}}}", axis),
            format!("${{{{matrix.{}}}}}", axis),
        ] {
            out = out.replace(&needle, value);
        }
    }
    out
}
