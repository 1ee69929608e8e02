//! Filter expressions shared by remote list requests and local membership checks.
//!
//! Expressions serialize to the backend's operator format, e.g.
//! `{"name": {"$autocomplete": "lu"}}` or `{"$and": [...]}`. The serialized
//! form is canonical: object keys are sorted, the children of `$and`/`$or`/`$nor`
//! and the values of `$in`/`$nin` are sorted by their own serialization. Two
//! filters that differ only in that ordering therefore share a [`FilterHash`].
//!
//! Serialization also folds away shapes that do not change meaning: nested
//! `$and` inside `$and` (and `$or` inside `$or`) is flattened, a group left
//! with one child serializes as that child, and integral floats such as `1.0`
//! serialize as integers. `$nor` groups are never flattened.

use std::cmp::Ordering;
use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::FilterError;
use crate::models::{Entity, EntityId, EntityKind};

/// Identity of a filter: lowercase hex SHA-256 of its canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterHash(String);

impl FilterHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    Equal { field: String, value: Value },
    NotEqual { field: String, value: Value },
    Greater { field: String, value: Value },
    GreaterOrEqual { field: String, value: Value },
    Less { field: String, value: Value },
    LessOrEqual { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    NotIn { field: String, values: Vec<Value> },
    Exists { field: String, exists: bool },
    Contains { field: String, value: Value },
    Autocomplete { field: String, prefix: String },
    And(Vec<FilterExpression>),
    Or(Vec<FilterExpression>),
    Nor(Vec<FilterExpression>),
}

fn checked_field(field: impl Into<String>) -> Result<String, FilterError> {
    let field = field.into();
    if field.trim().is_empty() {
        return Err(FilterError::EmptyField);
    }
    Ok(field)
}

fn checked_group(
    op: &'static str,
    children: Vec<FilterExpression>,
) -> Result<Vec<FilterExpression>, FilterError> {
    if children.is_empty() {
        return Err(FilterError::EmptyGroup(op));
    }
    Ok(children)
}

impl FilterExpression {
    pub fn equal(field: impl Into<String>, value: impl Into<Value>) -> Result<Self, FilterError> {
        Ok(Self::Equal {
            field: checked_field(field)?,
            value: value.into(),
        })
    }

    pub fn not_equal(field: impl Into<String>, value: impl Into<Value>) -> Result<Self, FilterError> {
        Ok(Self::NotEqual {
            field: checked_field(field)?,
            value: value.into(),
        })
    }

    pub fn greater(field: impl Into<String>, value: impl Into<Value>) -> Result<Self, FilterError> {
        Ok(Self::Greater {
            field: checked_field(field)?,
            value: value.into(),
        })
    }

    pub fn greater_or_equal(
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Self, FilterError> {
        Ok(Self::GreaterOrEqual {
            field: checked_field(field)?,
            value: value.into(),
        })
    }

    pub fn less(field: impl Into<String>, value: impl Into<Value>) -> Result<Self, FilterError> {
        Ok(Self::Less {
            field: checked_field(field)?,
            value: value.into(),
        })
    }

    pub fn less_or_equal(
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Self, FilterError> {
        Ok(Self::LessOrEqual {
            field: checked_field(field)?,
            value: value.into(),
        })
    }

    pub fn in_values<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Result<Self, FilterError> {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(FilterError::EmptyValues("$in"));
        }
        Ok(Self::In {
            field: checked_field(field)?,
            values,
        })
    }

    pub fn not_in_values<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Result<Self, FilterError> {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(FilterError::EmptyValues("$nin"));
        }
        Ok(Self::NotIn {
            field: checked_field(field)?,
            values,
        })
    }

    pub fn exists(field: impl Into<String>, exists: bool) -> Result<Self, FilterError> {
        Ok(Self::Exists {
            field: checked_field(field)?,
            exists,
        })
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Result<Self, FilterError> {
        Ok(Self::Contains {
            field: checked_field(field)?,
            value: value.into(),
        })
    }

    pub fn autocomplete(
        field: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Result<Self, FilterError> {
        Ok(Self::Autocomplete {
            field: checked_field(field)?,
            prefix: prefix.into(),
        })
    }

    pub fn all(children: Vec<FilterExpression>) -> Result<Self, FilterError> {
        Ok(Self::And(checked_group("$and", children)?))
    }

    pub fn any(children: Vec<FilterExpression>) -> Result<Self, FilterError> {
        Ok(Self::Or(checked_group("$or", children)?))
    }

    pub fn none(children: Vec<FilterExpression>) -> Result<Self, FilterError> {
        Ok(Self::Nor(checked_group("$nor", children)?))
    }

    /// Key-field equality, the identity constraint used for membership checks.
    pub fn id_equals(kind: EntityKind, id: &EntityId) -> Self {
        Self::Equal {
            field: kind.id_field().to_string(),
            value: Value::String(id.as_str().to_string()),
        }
    }

    /// Conjunction of `self` and `other`. Neither input is modified.
    pub fn and(&self, other: FilterExpression) -> FilterExpression {
        FilterExpression::And(vec![self.clone(), other])
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Equal { field, value } => field_op(field, "$eq", canonical_value(value)),
            Self::NotEqual { field, value } => field_op(field, "$ne", canonical_value(value)),
            Self::Greater { field, value } => field_op(field, "$gt", canonical_value(value)),
            Self::GreaterOrEqual { field, value } => {
                field_op(field, "$gte", canonical_value(value))
            }
            Self::Less { field, value } => field_op(field, "$lt", canonical_value(value)),
            Self::LessOrEqual { field, value } => field_op(field, "$lte", canonical_value(value)),
            Self::In { field, values } => field_op(field, "$in", sorted_array(canonical_values(values))),
            Self::NotIn { field, values } => {
                field_op(field, "$nin", sorted_array(canonical_values(values)))
            }
            Self::Exists { field, exists } => field_op(field, "$exists", Value::Bool(*exists)),
            Self::Contains { field, value } => field_op(field, "$contains", canonical_value(value)),
            Self::Autocomplete { field, prefix } => {
                field_op(field, "$autocomplete", Value::String(prefix.clone()))
            }
            Self::And(children) => {
                let mut flat = Vec::new();
                flatten_into(children, nested_and, &mut flat);
                group_json("$and", &flat, true)
            }
            Self::Or(children) => {
                let mut flat = Vec::new();
                flatten_into(children, nested_or, &mut flat);
                group_json("$or", &flat, true)
            }
            Self::Nor(children) => {
                let children: Vec<&FilterExpression> = children.iter().collect();
                group_json("$nor", &children, false)
            }
        }
    }

    pub fn serialize_canonical(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }

    pub fn hash(&self) -> FilterHash {
        let digest = Sha256::digest(self.serialize_canonical());
        FilterHash(hex::encode(digest))
    }

    pub fn from_json(value: &Value) -> Result<Self, FilterError> {
        let object = value
            .as_object()
            .ok_or_else(|| FilterError::Malformed(format!("expected object, got {value}")))?;
        if object.is_empty() {
            return Err(FilterError::Malformed("empty filter object".to_string()));
        }

        let mut clauses = Vec::with_capacity(object.len());
        for (key, operand) in object {
            if key.starts_with('$') {
                clauses.push(parse_group(key, operand)?);
            } else {
                clauses.extend(parse_field(key, operand)?);
            }
        }

        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(FilterExpression::And(clauses))
        }
    }

    /// Local evaluation against a cached entity.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::Equal { field, value } => entity
                .field(field)
                .is_some_and(|actual| values_equal(&actual, value)),
            Self::NotEqual { field, value } => !entity
                .field(field)
                .is_some_and(|actual| values_equal(&actual, value)),
            Self::Greater { field, value } => {
                compare_field(entity, field, value) == Some(Ordering::Greater)
            }
            Self::GreaterOrEqual { field, value } => matches!(
                compare_field(entity, field, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Less { field, value } => {
                compare_field(entity, field, value) == Some(Ordering::Less)
            }
            Self::LessOrEqual { field, value } => matches!(
                compare_field(entity, field, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::In { field, values } => entity
                .field(field)
                .is_some_and(|actual| value_in(&actual, values)),
            Self::NotIn { field, values } => !entity
                .field(field)
                .is_some_and(|actual| value_in(&actual, values)),
            Self::Exists { field, exists } => {
                let present = entity.field(field).is_some_and(|v| !v.is_null());
                present == *exists
            }
            Self::Contains { field, value } => match entity.field(field) {
                Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, value)),
                Some(Value::String(text)) => value.as_str().is_some_and(|needle| text.contains(needle)),
                _ => false,
            },
            Self::Autocomplete { field, prefix } => match entity.field(field) {
                Some(Value::String(text)) => {
                    let prefix = prefix.to_lowercase();
                    text.split_whitespace()
                        .any(|word| word.to_lowercase().starts_with(&prefix))
                }
                _ => false,
            },
            Self::And(children) => children.iter().all(|c| c.matches(entity)),
            Self::Or(children) => children.iter().any(|c| c.matches(entity)),
            Self::Nor(children) => !children.iter().any(|c| c.matches(entity)),
        }
    }
}

fn field_op(field: &str, op: &str, operand: Value) -> Value {
    let mut inner = Map::new();
    inner.insert(op.to_string(), operand);
    let mut outer = Map::new();
    outer.insert(field.to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn sorted_array(mut values: Vec<Value>) -> Value {
    values.sort_by_cached_key(|v| v.to_string());
    values.dedup();
    Value::Array(values)
}

fn nested_and(expression: &FilterExpression) -> Option<&[FilterExpression]> {
    match expression {
        FilterExpression::And(children) => Some(children.as_slice()),
        _ => None,
    }
}

fn nested_or(expression: &FilterExpression) -> Option<&[FilterExpression]> {
    match expression {
        FilterExpression::Or(children) => Some(children.as_slice()),
        _ => None,
    }
}

fn flatten_into<'a>(
    children: &'a [FilterExpression],
    nested: fn(&FilterExpression) -> Option<&[FilterExpression]>,
    out: &mut Vec<&'a FilterExpression>,
) {
    for child in children {
        match nested(child) {
            Some(inner) => flatten_into(inner, nested, out),
            None => out.push(child),
        }
    }
}

fn group_json(op: &str, children: &[&FilterExpression], unwrap_single: bool) -> Value {
    let mut children: Vec<Value> = children.iter().map(|c| c.to_json()).collect();
    children.sort_by_cached_key(|v| v.to_string());
    children.dedup();
    if unwrap_single && children.len() == 1 {
        return children.remove(0);
    }
    let mut outer = Map::new();
    outer.insert(op.to_string(), Value::Array(children));
    Value::Object(outer)
}

/// Integral floats become integers so `1.0` and `1` serialize alike.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
                Value::from(f as i64)
            }
            _ => value.clone(),
        },
        Value::Array(items) => Value::Array(canonical_values(items)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn canonical_values(values: &[Value]) -> Vec<Value> {
    values.iter().map(canonical_value).collect()
}

fn parse_group(op: &str, operand: &Value) -> Result<FilterExpression, FilterError> {
    let op: &'static str = match op {
        "$and" => "$and",
        "$or" => "$or",
        "$nor" => "$nor",
        other => return Err(FilterError::UnknownOperator(other.to_string())),
    };
    let items = operand
        .as_array()
        .ok_or_else(|| FilterError::Malformed(format!("{op} expects an array")))?;
    let children = items
        .iter()
        .map(FilterExpression::from_json)
        .collect::<Result<Vec<_>, _>>()?;
    let children = checked_group(op, children)?;
    Ok(match op {
        "$and" => FilterExpression::And(children),
        "$or" => FilterExpression::Or(children),
        _ => FilterExpression::Nor(children),
    })
}

fn parse_field(field: &str, operand: &Value) -> Result<Vec<FilterExpression>, FilterError> {
    let operators = match operand {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
        // A bare value is shorthand for `$eq`.
        other => return Ok(vec![FilterExpression::equal(field, other.clone())?]),
    };

    operators
        .iter()
        .map(|(op, value)| parse_operator(field, op, value))
        .collect()
}

fn parse_operator(field: &str, op: &str, value: &Value) -> Result<FilterExpression, FilterError> {
    let as_array = || {
        value
            .as_array()
            .cloned()
            .ok_or_else(|| FilterError::Malformed(format!("{op} on {field} expects an array")))
    };
    match op {
        "$eq" => FilterExpression::equal(field, value.clone()),
        "$ne" => FilterExpression::not_equal(field, value.clone()),
        "$gt" => FilterExpression::greater(field, value.clone()),
        "$gte" => FilterExpression::greater_or_equal(field, value.clone()),
        "$lt" => FilterExpression::less(field, value.clone()),
        "$lte" => FilterExpression::less_or_equal(field, value.clone()),
        "$in" => FilterExpression::in_values(field, as_array()?),
        "$nin" => FilterExpression::not_in_values(field, as_array()?),
        "$exists" => {
            let exists = value.as_bool().ok_or_else(|| {
                FilterError::Malformed(format!("$exists on {field} expects a bool"))
            })?;
            FilterExpression::exists(field, exists)
        }
        "$contains" => FilterExpression::contains(field, value.clone()),
        "$autocomplete" => {
            let prefix = value.as_str().ok_or_else(|| {
                FilterError::Malformed(format!("$autocomplete on {field} expects a string"))
            })?;
            FilterExpression::autocomplete(field, prefix)
        }
        other => Err(FilterError::UnknownOperator(other.to_string())),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn value_in(actual: &Value, candidates: &[Value]) -> bool {
    match actual {
        Value::Array(items) => items
            .iter()
            .any(|item| candidates.iter().any(|c| values_equal(item, c))),
        single => candidates.iter().any(|c| values_equal(single, c)),
    }
}

fn compare_field(entity: &Entity, field: &str, value: &Value) -> Option<Ordering> {
    let actual = entity.field(field)?;
    match (&actual, value) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Serialize for FilterExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FilterExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FilterExpression::from_json(&value).map_err(de::Error::custom)
    }
}
