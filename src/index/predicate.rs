//! Predicate AST and the tolerant JSON query parser.
//!
//! Queries arrive as JSON in the familiar shape
//! `{ "type": "Concept", "score": { "gte": 0.75 } }` with operator aliases
//! accepted at the parse boundary (`eq`/`equals`/`is`, `in`/`oneOf`, …).
//! Parsing collapses every alias to a single canonical operator set; alias
//! strings never travel past this module, and evaluation matches on the
//! tagged variants alone.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredicateError {
    #[error("predicate must be a JSON object, got {0}")]
    NotAnObject(String),
    #[error("unknown operator '{op}' on field '{field}'")]
    UnknownOperator { field: String, op: String },
    #[error("operator '{op}' on field '{field}' expects {expected}")]
    InvalidOperand {
        field: String,
        op: String,
        expected: &'static str,
    },
    #[error("combinator '{0}' expects an array of predicates")]
    InvalidCombinator(String),
    #[error("empty predicate")]
    Empty,
}

/// Canonical comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// String predicates, evaluated by candidate-chunk scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOp {
    StartsWith,
    EndsWith,
    Matches,
}

/// Canonical predicate AST.
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    Between {
        field: String,
        lo: Value,
        hi: Value,
    },
    /// Multi-valued field contains the value.
    Contains {
        field: String,
        value: Value,
    },
    /// Field present (`expected == true`) or absent.
    Exists {
        field: String,
        expected: bool,
    },
    Text {
        field: String,
        op: TextOp,
        pattern: String,
    },
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Parse a JSON query object into the canonical AST.
    pub fn parse(query: &Value) -> Result<Self, PredicateError> {
        let Value::Object(map) = query else {
            return Err(PredicateError::NotAnObject(type_name(query).to_string()));
        };
        if map.is_empty() {
            return Err(PredicateError::Empty);
        }

        let mut parts = Vec::with_capacity(map.len());
        for (key, spec) in map {
            match key.as_str() {
                "allOf" | "and" => parts.push(Self::parse_list(key, spec).map(Predicate::All)?),
                "anyOf" | "or" => parts.push(Self::parse_list(key, spec).map(Predicate::Any)?),
                "not" => parts.push(Predicate::Not(Box::new(Self::parse(spec)?))),
                _ => parts.push(Self::parse_field(key, spec)?),
            }
        }
        Ok(Self::flatten_all(parts))
    }

    fn flatten_all(mut parts: Vec<Predicate>) -> Predicate {
        if parts.len() == 1 {
            parts.pop().expect("one element")
        } else {
            Predicate::All(parts)
        }
    }

    fn parse_list(key: &str, spec: &Value) -> Result<Vec<Predicate>, PredicateError> {
        let Value::Array(items) = spec else {
            return Err(PredicateError::InvalidCombinator(key.to_string()));
        };
        items.iter().map(Self::parse).collect()
    }

    fn parse_field(field: &str, spec: &Value) -> Result<Predicate, PredicateError> {
        match spec {
            // Bare primitive is equality; bare array is set membership.
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                Ok(Predicate::Compare {
                    field: field.to_string(),
                    op: CompareOp::Eq,
                    value: spec.clone(),
                })
            }
            Value::Array(items) => Ok(Predicate::In {
                field: field.to_string(),
                values: items.clone(),
            }),
            Value::Object(ops) => {
                if ops.is_empty() {
                    return Err(PredicateError::Empty);
                }
                let mut parts = Vec::with_capacity(ops.len());
                for (op, operand) in ops {
                    parts.push(Self::parse_operator(field, op, operand)?);
                }
                Ok(Self::flatten_all(parts))
            }
        }
    }

    fn parse_operator(
        field: &str,
        op: &str,
        operand: &Value,
    ) -> Result<Predicate, PredicateError> {
        let field_s = field.to_string();
        let compare = |op| Predicate::Compare {
            field: field_s.clone(),
            op,
            value: operand.clone(),
        };
        match op {
            "eq" | "equals" | "is" => Ok(compare(CompareOp::Eq)),
            "ne" | "notEquals" | "neq" | "isNot" => Ok(compare(CompareOp::Ne)),
            "gt" | "greaterThan" => Ok(compare(CompareOp::Gt)),
            "gte" | "greaterThanOrEqual" | "atLeast" => Ok(compare(CompareOp::Gte)),
            "lt" | "lessThan" => Ok(compare(CompareOp::Lt)),
            "lte" | "lessThanOrEqual" | "atMost" => Ok(compare(CompareOp::Lte)),
            "in" | "oneOf" => match operand {
                Value::Array(items) => Ok(Predicate::In {
                    field: field_s,
                    values: items.clone(),
                }),
                _ => Err(PredicateError::InvalidOperand {
                    field: field_s,
                    op: op.to_string(),
                    expected: "an array of values",
                }),
            },
            "between" => match operand {
                Value::Array(items) if items.len() == 2 => Ok(Predicate::Between {
                    field: field_s,
                    lo: items[0].clone(),
                    hi: items[1].clone(),
                }),
                _ => Err(PredicateError::InvalidOperand {
                    field: field_s,
                    op: op.to_string(),
                    expected: "a two-element [lo, hi] array",
                }),
            },
            "contains" | "has" => Ok(Predicate::Contains {
                field: field_s,
                value: operand.clone(),
            }),
            "exists" => match operand {
                Value::Bool(expected) => Ok(Predicate::Exists {
                    field: field_s,
                    expected: *expected,
                }),
                _ => Err(PredicateError::InvalidOperand {
                    field: field_s,
                    op: op.to_string(),
                    expected: "a boolean",
                }),
            },
            "missing" => match operand {
                Value::Bool(missing) => Ok(Predicate::Exists {
                    field: field_s,
                    expected: !missing,
                }),
                _ => Err(PredicateError::InvalidOperand {
                    field: field_s,
                    op: op.to_string(),
                    expected: "a boolean",
                }),
            },
            "startsWith" | "beginsWith" => Self::text(field_s, TextOp::StartsWith, op, operand),
            "endsWith" => Self::text(field_s, TextOp::EndsWith, op, operand),
            "matches" | "regex" => Self::text(field_s, TextOp::Matches, op, operand),
            _ => Err(PredicateError::UnknownOperator {
                field: field_s,
                op: op.to_string(),
            }),
        }
    }

    fn text(
        field: String,
        text_op: TextOp,
        op: &str,
        operand: &Value,
    ) -> Result<Predicate, PredicateError> {
        match operand {
            Value::String(pattern) => Ok(Predicate::Text {
                field,
                op: text_op,
                pattern: pattern.clone(),
            }),
            _ => Err(PredicateError::InvalidOperand {
                field,
                op: op.to_string(),
                expected: "a string pattern",
            }),
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
