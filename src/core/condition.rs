//! Boolean condition trees over an allow-listed context.
//!
//! Grammar:
//! - leaf: `{"field": f, "<op>": value}` with exactly one op from
//!   `equals`, `not_equals`, `contains`, `not_contains`, `starts_with`,
//!   `ends_with`, or `{"field": f, "present": bool}`. The explicit spelling
//!   `{"field": f, "operator": "<op>", "value": v}` is accepted too.
//! - composite: `{"all": [...]}` or `{"any": [...]}`.
//!
//! Evaluation fails closed: a malformed tree, a field outside the allow-list,
//! or an empty composite all evaluate to `false`.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::ContextLookup;

/// Structural problems in a condition tree
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("condition must be a JSON object")]
    NotAnObject,

    #[error("leaf condition needs a non-empty string `field`")]
    MissingField,

    #[error("leaf condition must have exactly one operator, found {0}")]
    OperatorCount(usize),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("`present` must be a boolean")]
    PresentNotBool,

    #[error("comparison value must be a string, number or boolean")]
    NonScalarValue,

    #[error("`{0}` must be a list")]
    CompositeNotList(&'static str),

    #[error("`{0}` must not be empty")]
    EmptyComposite(&'static str),

    #[error("unexpected key: {0}")]
    UnexpectedKey(String),
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
}

impl Operator {
    const ALL: [Operator; 6] = [
        Operator::Equals,
        Operator::NotEquals,
        Operator::Contains,
        Operator::NotContains,
        Operator::StartsWith,
        Operator::EndsWith,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }

    fn apply(&self, actual: &str, expected: &str) -> bool {
        match self {
            Operator::Equals => actual == expected,
            Operator::NotEquals => actual != expected,
            Operator::Contains => actual.contains(expected),
            Operator::NotContains => !actual.contains(expected),
            Operator::StartsWith => actual.starts_with(expected),
            Operator::EndsWith => actual.ends_with(expected),
        }
    }
}

/// A parsed condition tree
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionExpr {
    All(Vec<ConditionExpr>),
    Any(Vec<ConditionExpr>),
    Compare {
        field: String,
        op: Operator,
        value: Value,
    },
    Present {
        field: String,
        expected: bool,
    },
}

impl ConditionExpr {
    /// Parse a JSON tree. Empty composites parse (they evaluate to false);
    /// everything else that is not well-formed is an error, at any depth.
    pub fn parse(config: &Value) -> Result<Self, ConditionError> {
        let obj = config.as_object().ok_or(ConditionError::NotAnObject)?;

        if obj.contains_key("all") || obj.contains_key("any") {
            return Self::parse_composite(obj);
        }
        Self::parse_leaf(obj)
    }

    fn parse_composite(obj: &Map<String, Value>) -> Result<Self, ConditionError> {
        if obj.len() != 1 {
            let extra = obj
                .keys()
                .find(|k| k.as_str() != "all" && k.as_str() != "any")
                .cloned()
                .unwrap_or_else(|| "all/any".to_string());
            return Err(ConditionError::UnexpectedKey(extra));
        }

        let (key, items) = match (obj.get("all"), obj.get("any")) {
            (Some(items), None) => ("all", items),
            (None, Some(items)) => ("any", items),
            _ => return Err(ConditionError::UnexpectedKey("all/any".to_string())),
        };

        let list = items.as_array().ok_or(ConditionError::CompositeNotList(key))?;
        let children = list.iter().map(Self::parse).collect::<Result<Vec<_>, _>>()?;

        Ok(if key == "all" {
            ConditionExpr::All(children)
        } else {
            ConditionExpr::Any(children)
        })
    }

    fn parse_leaf(obj: &Map<String, Value>) -> Result<Self, ConditionError> {
        let field = obj
            .get("field")
            .and_then(Value::as_str)
            .filter(|f| !f.trim().is_empty())
            .ok_or(ConditionError::MissingField)?
            .to_string();

        let mut found: Vec<Self> = Vec::new();
        let mut operator_count = 0usize;

        for (key, value) in obj {
            match key.as_str() {
                "field" => {}
                "present" => {
                    operator_count += 1;
                    let expected = value.as_bool().ok_or(ConditionError::PresentNotBool)?;
                    found.push(ConditionExpr::Present {
                        field: field.clone(),
                        expected,
                    });
                }
                "operator" => {
                    operator_count += 1;
                    let name = value
                        .as_str()
                        .ok_or_else(|| ConditionError::UnknownOperator(value.to_string()))?;
                    let op = Operator::parse(name).ok_or_else(|| ConditionError::UnknownOperator(name.to_string()))?;
                    let expected = obj.get("value").ok_or(ConditionError::NonScalarValue)?;
                    found.push(ConditionExpr::Compare {
                        field: field.clone(),
                        op,
                        value: scalar(expected)?,
                    });
                }
                "value" => {
                    if !obj.contains_key("operator") {
                        return Err(ConditionError::UnexpectedKey("value".to_string()));
                    }
                }
                other => match Operator::parse(other) {
                    Some(op) => {
                        operator_count += 1;
                        found.push(ConditionExpr::Compare {
                            field: field.clone(),
                            op,
                            value: scalar(value)?,
                        });
                    }
                    None => return Err(ConditionError::UnexpectedKey(other.to_string())),
                },
            }
        }

        if operator_count != 1 {
            return Err(ConditionError::OperatorCount(operator_count));
        }
        found.pop().ok_or(ConditionError::OperatorCount(0))
    }

    /// Stricter check applied before a tree is stored: composites must not be
    /// empty anywhere, since such a rule could never match.
    pub fn validate_for_storage(&self) -> Result<(), ConditionError> {
        match self {
            ConditionExpr::All(children) | ConditionExpr::Any(children) => {
                if children.is_empty() {
                    let key = if matches!(self, ConditionExpr::All(_)) { "all" } else { "any" };
                    return Err(ConditionError::EmptyComposite(key));
                }
                children.iter().try_for_each(Self::validate_for_storage)
            }
            ConditionExpr::Compare { .. } | ConditionExpr::Present { .. } => Ok(()),
        }
    }

    /// Evaluate against a context. Fields outside `allowed_fields` are false.
    pub fn eval<C: ContextLookup + ?Sized>(&self, ctx: &C, allowed_fields: &[&str]) -> bool {
        match self {
            ConditionExpr::All(children) => {
                !children.is_empty() && children.iter().all(|c| c.eval(ctx, allowed_fields))
            }
            ConditionExpr::Any(children) => {
                !children.is_empty() && children.iter().any(|c| c.eval(ctx, allowed_fields))
            }
            ConditionExpr::Compare { field, op, value } => {
                if !allowed_fields.contains(&field.as_str()) {
                    return false;
                }
                let actual = match ctx.lookup(field).as_ref().and_then(comparable) {
                    Some(actual) => actual,
                    None => return false,
                };
                let expected = match comparable(value) {
                    Some(expected) => expected,
                    None => return false,
                };
                op.apply(&actual, &expected)
            }
            ConditionExpr::Present { field, expected } => {
                if !allowed_fields.contains(&field.as_str()) {
                    return false;
                }
                let present = ctx.lookup(field).map_or(false, |v| is_present(&v));
                present == *expected
            }
        }
    }
}

/// Evaluate a raw condition tree. Never errors: anything malformed is false.
pub fn evaluate<C: ContextLookup + ?Sized>(config: &Value, ctx: &C, allowed_fields: &[&str]) -> bool {
    match ConditionExpr::parse(config) {
        Ok(expr) => expr.eval(ctx, allowed_fields),
        Err(_) => false,
    }
}

/// Rule-level AND across a condition list. An empty list passes.
///
/// Unlike [`evaluate`], a malformed tree is reported, so the caller can take
/// the rule out of service instead of silently never matching.
pub fn evaluate_rule<C: ContextLookup + ?Sized>(
    conditions: &[&Value],
    ctx: &C,
    allowed_fields: &[&str],
) -> Result<bool, ConditionError> {
    let parsed = conditions
        .iter()
        .map(|c| ConditionExpr::parse(c))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parsed.iter().all(|expr| expr.eval(ctx, allowed_fields)))
}

fn scalar(value: &Value) -> Result<Value, ConditionError> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(value.clone()),
        _ => Err(ConditionError::NonScalarValue),
    }
}

/// Lowercased text form used for comparisons.
fn comparable(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}
