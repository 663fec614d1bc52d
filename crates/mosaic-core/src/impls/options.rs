//! OptionsValidator implementations.

use std::collections::HashMap;
use std::path::Path;

use crate::domain::{MosaicError, TaskOption};
use crate::ports::{OptionKind, OptionSpec, OptionsValidator};

/// Accepts every option unchanged. Used when the engine declares no schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveValidator;

impl OptionsValidator for PermissiveValidator {
    fn schema(&self) -> Vec<OptionSpec> {
        Vec::new()
    }

    fn validate(&self, options: Vec<TaskOption>) -> Result<Vec<TaskOption>, MosaicError> {
        reject_duplicates(&options)?;
        Ok(options)
    }
}

/// Checks options against the engine's declared schema and coerces string
/// values (as sent by form posts) to the declared type.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    specs: Vec<OptionSpec>,
    by_name: HashMap<String, usize>,
}

impl SchemaValidator {
    pub fn new(specs: Vec<OptionSpec>) -> Self {
        let by_name = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.name.clone(), i))
            .collect();
        Self { specs, by_name }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, MosaicError> {
        let text = std::fs::read_to_string(path)?;
        let specs: Vec<OptionSpec> = serde_json::from_str(&text)?;
        Ok(Self::new(specs))
    }

    fn coerce(spec: &OptionSpec, value: serde_json::Value) -> Result<serde_json::Value, MosaicError> {
        use serde_json::Value;

        let invalid = || {
            MosaicError::Validation(format!(
                "invalid value for option {}: expected {:?}",
                spec.name, spec.kind
            ))
        };
        match (spec.kind, value) {
            (OptionKind::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(Value::Number(n)),
            (OptionKind::Int, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid()),
            (OptionKind::Float, Value::Number(n)) => Ok(Value::Number(n)),
            (OptionKind::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(invalid),
            (OptionKind::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (OptionKind::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            (OptionKind::String, Value::String(s)) => Ok(Value::String(s)),
            (OptionKind::String, v @ (Value::Number(_) | Value::Bool(_))) => {
                Ok(Value::String(v.to_string()))
            }
            (OptionKind::Enum, Value::String(s)) if spec.domain.iter().any(|d| *d == s) => {
                Ok(Value::String(s))
            }
            _ => Err(invalid()),
        }
    }
}

impl OptionsValidator for SchemaValidator {
    fn schema(&self) -> Vec<OptionSpec> {
        self.specs.clone()
    }

    fn validate(&self, options: Vec<TaskOption>) -> Result<Vec<TaskOption>, MosaicError> {
        reject_duplicates(&options)?;
        options
            .into_iter()
            .map(|option| {
                let spec = self
                    .by_name
                    .get(&option.name)
                    .map(|&i| &self.specs[i])
                    .ok_or_else(|| {
                        MosaicError::Validation(format!("unknown option: {}", option.name))
                    })?;
                let value = Self::coerce(spec, option.value)?;
                Ok(TaskOption {
                    name: option.name,
                    value,
                })
            })
            .collect()
    }
}

fn reject_duplicates(options: &[TaskOption]) -> Result<(), MosaicError> {
    for (i, option) in options.iter().enumerate() {
        if option.name.trim().is_empty() {
            return Err(MosaicError::Validation("option name missing".to_string()));
        }
        if options[..i].iter().any(|o| o.name == option.name) {
            return Err(MosaicError::Validation(format!(
                "duplicate option: {}",
                option.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn validator() -> SchemaValidator {
        let specs: Vec<OptionSpec> = serde_json::from_value(json!([
            {"name": "min-num-features", "type": "int", "value": 8000},
            {"name": "orthophoto-resolution", "type": "float", "value": 5.0},
            {"name": "fast-orthophoto", "type": "bool", "value": false},
            {"name": "pc-quality", "type": "enum", "value": "medium", "domain": ["low", "medium", "high"]},
            {"name": "crop", "type": "string", "value": "3"}
        ]))
        .unwrap();
        SchemaValidator::new(specs)
    }

    #[rstest]
    #[case("min-num-features", json!("10000"), json!(10000))]
    #[case("min-num-features", json!(12), json!(12))]
    #[case("orthophoto-resolution", json!("2.5"), json!(2.5))]
    #[case("fast-orthophoto", json!("true"), json!(true))]
    #[case("fast-orthophoto", json!(false), json!(false))]
    #[case("pc-quality", json!("high"), json!("high"))]
    #[case("crop", json!(0), json!("0"))]
    fn values_are_coerced(
        #[case] name: &str,
        #[case] value: serde_json::Value,
        #[case] expected: serde_json::Value,
    ) {
        let out = validator()
            .validate(vec![TaskOption::new(name, value)])
            .unwrap();
        assert_eq!(out[0].value, expected);
    }

    #[rstest]
    #[case("min-num-features", json!("many"))]
    #[case("fast-orthophoto", json!("maybe"))]
    #[case("pc-quality", json!("ultra"))]
    #[case("no-such-option", json!(1))]
    fn bad_options_are_validation_errors(#[case] name: &str, #[case] value: serde_json::Value) {
        let err = validator()
            .validate(vec![TaskOption::new(name, value)])
            .unwrap_err();
        assert!(matches!(err, MosaicError::Validation(_)));
    }

    #[test]
    fn order_is_preserved() {
        let out = validator()
            .validate(vec![
                TaskOption::new("pc-quality", "low"),
                TaskOption::new("min-num-features", 100),
            ])
            .unwrap();
        let names: Vec<&str> = out.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["pc-quality", "min-num-features"]);
    }

    #[test]
    fn duplicates_are_rejected_even_when_permissive() {
        let options = vec![TaskOption::new("a", 1), TaskOption::new("a", 2)];
        assert!(PermissiveValidator.validate(options).is_err());
        assert!(PermissiveValidator
            .validate(vec![TaskOption::new("anything", "goes")])
            .is_ok());
    }
}
