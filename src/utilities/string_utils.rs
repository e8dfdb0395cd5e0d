//! Prompt template helpers.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

static VARIABLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_\-]*)\}").unwrap());

/// Names of every `{variable}` placeholder in `template`, in order of first use.
pub fn template_variables(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in VARIABLE_PATTERN.captures_iter(template) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Interpolate `{key}` placeholders in a string while leaving JSON untouched.
///
/// Only placeholders matching `{identifier}` are considered, so literal JSON
/// examples such as `{"name": "..."}` inside a prompt survive unchanged.
///
/// # Arguments
/// * `input` - The template.
/// * `inputs` - Values for the template variables.
///
/// # Errors
/// Returns the name of the first variable missing from `inputs`.
pub fn interpolate_only(input: &str, inputs: &HashMap<String, String>) -> Result<String, String> {
    if !input.contains('{') {
        return Ok(input.to_string());
    }

    let variables = template_variables(input);
    if let Some(missing) = variables.iter().find(|v| !inputs.contains_key(*v)) {
        return Err(format!(
            "template variable '{}' not found in inputs",
            missing
        ));
    }

    let result = VARIABLE_PATTERN.replace_all(input, |caps: &regex::Captures<'_>| {
        inputs.get(&caps[1]).cloned().unwrap_or_default()
    });
    Ok(result.into_owned())
}

/// Shorten `text` to at most `max_chars` characters, appending an ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
