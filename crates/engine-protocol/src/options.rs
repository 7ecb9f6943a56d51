//! Engine option schema, as reported during the handshake, and validation of
//! user-configured values against it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A configured option value. Configuration files give these untyped, so the
/// variant is whatever TOML produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

impl From<i64> for OptionValue {
    fn from(i: i64) -> Self {
        OptionValue::Int(i)
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::String(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionKind {
    Check { default: bool },
    Spin { default: i64, min: i64, max: i64 },
    Combo { default: String, vars: Vec<String> },
    Button,
    String { default: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSchema {
    pub name: String,
    pub kind: OptionKind,
}

/// An option that passed validation, ready to be sent. `value` is `None` for buttons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedOption {
    pub name: String,
    pub kind: OptionKind,
    pub value: Option<String>,
}

impl OptionSchema {
    fn invalid(&self, value: &OptionValue, why: &str) -> EngineError {
        EngineError::Config(format!(
            "invalid value {value} for engine option {}: {why}",
            self.name
        ))
    }

    /// Checks `value` against this option and returns its wire form.
    pub fn validate(&self, value: &OptionValue) -> Result<ValidatedOption, EngineError> {
        let wire = match (&self.kind, value) {
            (OptionKind::Button, _) => None,
            (OptionKind::Check { .. }, OptionValue::Bool(b)) => Some(b.to_string()),
            (OptionKind::Check { .. }, OptionValue::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "false" => Some(s.to_ascii_lowercase()),
                _ => return Err(self.invalid(value, "expected true or false")),
            },
            (OptionKind::Check { .. }, OptionValue::Int(i @ (0 | 1))) => Some((*i == 1).to_string()),
            (OptionKind::Check { .. }, _) => return Err(self.invalid(value, "expected true or false")),
            (OptionKind::Spin { min, max, .. }, _) => {
                let n = match value {
                    OptionValue::Int(i) => *i,
                    OptionValue::String(s) => s
                        .trim()
                        .parse()
                        .map_err(|_| self.invalid(value, "expected an integer"))?,
                    OptionValue::Bool(_) => return Err(self.invalid(value, "expected an integer")),
                };
                if n < *min || n > *max {
                    return Err(self.invalid(value, &format!("outside {min}..={max}")));
                }
                Some(n.to_string())
            }
            (OptionKind::Combo { vars, .. }, _) => {
                let wanted = value.to_string();
                let var = vars
                    .iter()
                    .find(|v| v.eq_ignore_ascii_case(&wanted))
                    .ok_or_else(|| self.invalid(value, &format!("expected one of {vars:?}")))?;
                Some(var.clone())
            }
            (OptionKind::String { .. }, _) => Some(value.to_string()),
        };
        Ok(ValidatedOption {
            name: self.name.clone(),
            kind: self.kind.clone(),
            value: wire,
        })
    }
}

/// Validates every requested option against the engine's schema.
/// Unknown names are configuration errors.
pub fn validate_options(
    schema: &[OptionSchema],
    requested: &BTreeMap<String, OptionValue>,
    case_insensitive: bool,
) -> Result<Vec<ValidatedOption>, EngineError> {
    requested
        .iter()
        .map(|(name, value)| {
            let option = schema
                .iter()
                .find(|o| {
                    if case_insensitive {
                        o.name.eq_ignore_ascii_case(name)
                    } else {
                        o.name == *name
                    }
                })
                .ok_or_else(|| EngineError::Config(format!("unknown engine option: {name}")))?;
            option.validate(value)
        })
        .collect()
}

/// Parses a UCI `option name <id> type <t> [default <x>] [min <x>] [max <x>] [var <x>]*` line.
pub fn parse_uci_option(line: &str) -> Option<OptionSchema> {
    let rest = line.trim().strip_prefix("option")?;
    let tokens: Vec<&str> = rest.split_whitespace().collect();

    const KEYWORDS: [&str; 6] = ["name", "type", "default", "min", "max", "var"];
    let mut fields: Vec<(&str, String)> = Vec::new();
    let mut current: Option<(&str, Vec<&str>)> = None;
    for token in tokens {
        if KEYWORDS.contains(&token) {
            if let Some((key, words)) = current.take() {
                fields.push((key, words.join(" ")));
            }
            current = Some((token, Vec::new()));
        } else if let Some((_, words)) = current.as_mut() {
            words.push(token);
        }
    }
    if let Some((key, words)) = current {
        fields.push((key, words.join(" ")));
    }

    let get = |key: &str| fields.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str());
    let name = get("name")?.to_string();
    if name.is_empty() {
        return None;
    }
    let default = get("default").unwrap_or("");
    let default = if default == "<empty>" { "" } else { default };

    let kind = match get("type")? {
        "check" => OptionKind::Check {
            default: default == "true",
        },
        "spin" => OptionKind::Spin {
            default: default.parse().unwrap_or(0),
            min: get("min").and_then(|v| v.parse().ok()).unwrap_or(i64::MIN),
            max: get("max").and_then(|v| v.parse().ok()).unwrap_or(i64::MAX),
        },
        "combo" => OptionKind::Combo {
            default: default.to_string(),
            vars: fields
                .iter()
                .filter(|(k, _)| *k == "var")
                .map(|(_, v)| v.clone())
                .collect(),
        },
        "button" => OptionKind::Button,
        "string" => OptionKind::String {
            default: default.to_string(),
        },
        _ => return None,
    };
    Some(OptionSchema { name, kind })
}

/// Parses the value of an XBoard `option="NAME -type ..."` feature.
pub fn parse_xboard_option(feature: &str) -> Option<OptionSchema> {
    let (name, rest) = feature.split_once(" -")?;
    let name = name.trim().to_string();
    let (kind, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();

    let kind = match kind {
        "spin" | "slider" => {
            let nums: Vec<i64> = args.split_whitespace().filter_map(|v| v.parse().ok()).collect();
            match nums.as_slice() {
                [default, min, max] => OptionKind::Spin {
                    default: *default,
                    min: *min,
                    max: *max,
                },
                _ => return None,
            }
        }
        "check" => OptionKind::Check {
            default: args == "1",
        },
        "combo" => {
            let entries: Vec<&str> = args.split("///").map(str::trim).collect();
            let default = entries
                .iter()
                .find_map(|e| e.strip_prefix('*'))
                .or(entries.first().copied())
                .unwrap_or("")
                .to_string();
            OptionKind::Combo {
                default,
                vars: entries
                    .iter()
                    .map(|e| e.trim_start_matches('*').to_string())
                    .collect(),
            }
        }
        "string" | "file" | "path" => OptionKind::String {
            default: args.to_string(),
        },
        "button" | "save" | "reset" => OptionKind::Button,
        _ => return None,
    };
    Some(OptionSchema { name, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uci_spin() {
        let o = parse_uci_option("option name Hash type spin default 16 min 1 max 33554432").unwrap();
        assert_eq!(o.name, "Hash");
        assert_eq!(
            o.kind,
            OptionKind::Spin {
                default: 16,
                min: 1,
                max: 33554432
            }
        );
    }

    #[test]
    fn test_parse_uci_multiword_name_and_combo() {
        let o = parse_uci_option("option name Skill Level type spin default 20 min 0 max 20").unwrap();
        assert_eq!(o.name, "Skill Level");

        let o = parse_uci_option("option name Style type combo default Normal var Solid var Normal var Risky")
            .unwrap();
        assert_eq!(
            o.kind,
            OptionKind::Combo {
                default: "Normal".to_string(),
                vars: vec!["Solid".to_string(), "Normal".to_string(), "Risky".to_string()]
            }
        );

        let o = parse_uci_option("option name Debug Log File type string default <empty>").unwrap();
        assert_eq!(o.kind, OptionKind::String { default: String::new() });
    }

    #[test]
    fn test_parse_xboard_options() {
        let o = parse_xboard_option("Hash -spin 64 1 1024").unwrap();
        assert_eq!(o.name, "Hash");
        let o = parse_xboard_option("Style -combo Solid /// *Normal /// Risky").unwrap();
        assert_eq!(
            o.kind,
            OptionKind::Combo {
                default: "Normal".to_string(),
                vars: vec!["Solid".to_string(), "Normal".to_string(), "Risky".to_string()]
            }
        );
        let o = parse_xboard_option("Clear Hash -button").unwrap();
        assert_eq!(o.name, "Clear Hash");
        assert_eq!(o.kind, OptionKind::Button);
    }

    #[test]
    fn test_validate_rejects_unknown_name() {
        let schema = vec![parse_uci_option("option name Hash type spin default 16 min 1 max 1024").unwrap()];
        let mut requested = BTreeMap::new();
        requested.insert("Hsh".to_string(), OptionValue::Int(64));
        let err = validate_options(&schema, &requested, true).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_validate_bounds_and_case() {
        let schema = vec![
            parse_uci_option("option name Hash type spin default 16 min 1 max 1024").unwrap(),
            parse_uci_option("option name OwnBook type check default false").unwrap(),
        ];
        let mut requested = BTreeMap::new();
        requested.insert("hash".to_string(), OptionValue::Int(256));
        requested.insert("OwnBook".to_string(), OptionValue::Bool(true));
        let validated = validate_options(&schema, &requested, true).unwrap();
        assert_eq!(validated[0].value.as_deref(), Some("true"));
        assert_eq!(validated[1].name, "Hash");
        assert_eq!(validated[1].value.as_deref(), Some("256"));

        requested.insert("hash".to_string(), OptionValue::Int(4096));
        assert!(validate_options(&schema, &requested, true).is_err());
        assert!(validate_options(&schema, &requested, false).is_err());
    }
}
