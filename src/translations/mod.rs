//! Prompt strings.
//!
//! Loads the prompt fragments agents and the manager are built from. The
//! default language is English, embedded from `en.json`.
//!
//! The data is organized into sections:
//! - `hierarchical_manager_agent`: persona of the built-in manager role
//! - `slices`: prompt fragments (role_playing, tools, task, feedback, ...)
//! - `errors`: observation texts fed back to an agent after a misstep

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::Value;

/// Raw English translation JSON, embedded at compile time.
pub const EN_JSON: &str = include_str!("en.json");

/// Shared default translations.
pub static I18N: Lazy<Translations> = Lazy::new(Translations::load_default);

/// Access to prompt fragments by dotted path.
#[derive(Debug, Clone)]
pub struct Translations {
    data: Value,
}

impl Translations {
    /// Load the embedded English translations.
    ///
    /// A broken embedded file leaves the store empty and logs an error;
    /// lookups then return `None`.
    pub fn load_default() -> Self {
        match Self::from_json(EN_JSON) {
            Ok(t) => t,
            Err(e) => {
                log::error!("{}", e);
                Self { data: Value::Null }
            }
        }
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        let data = serde_json::from_str(json).map_err(|e| format!("Failed to parse translations JSON: {}", e))?;
        Ok(Self { data })
    }

    /// Value at a dotted path (e.g. `slices.observation`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.data, |current, part| current.get(part))
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// `slices.<name>`, or an empty string.
    pub fn slice(&self, name: &str) -> &str {
        self.get_str(&format!("slices.{}", name)).unwrap_or_default()
    }

    /// `errors.<name>`, or an empty string.
    pub fn error(&self, name: &str) -> &str {
        self.get_str(&format!("errors.{}", name)).unwrap_or_default()
    }

    /// `(role, goal, backstory)` of the built-in manager.
    pub fn manager_persona(&self) -> (String, String, String) {
        let field = |name: &str| {
            self.get_str(&format!("hierarchical_manager_agent.{}", name))
                .unwrap_or_default()
                .to_string()
        };
        (field("role"), field("goal"), field("backstory"))
    }
}

impl Default for Translations {
    fn default() -> Self {
        Self::load_default()
    }
}

/// Fill `{name}` placeholders in `template` from `values`. Unknown
/// placeholders are left untouched.
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    let lookup: HashMap<&str, &str> = values.iter().copied().collect();
    let mut out = template.to_string();
    for (name, value) in lookup {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}
