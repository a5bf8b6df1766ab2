//! Predicate trees over object fields.
//!
//! A [`Query`] nests AND/OR nodes over [`Filter`] leaves. Leaf fields are
//! dotted paths resolved against the schema before evaluation: any number
//! of forward relations followed by one terminal attribute.
//!
//! ```text
//! name                   property
//! tags[site]             key inside a dict property
//! guid                   the object's guid
//! storagerouter_guid     guid held by a forward relation
//! storagerouter.name     property of the related object
//! label                  dynamic (disables caching without an explicit key)
//! disks                  guids of a reverse relation
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use hdal_schema::{Attribute, Hybrid};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dal::Dal;
use crate::error::{DalError, DalResult};
use crate::object::{cell_guid, Row};

/// Field marker meaning "any change to this type".
pub(crate) const ALL_FIELDS: &str = "__all";

/// Comparison applied by a [`Filter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Equals,
    NotEquals,
    Gt,
    Lt,
    /// Field value is an element of the array, or a substring of the string.
    In,
    /// Field value contains the string as a substring, or the element.
    Contains,
}

/// One leaf comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: Operator,
    pub value: Value,
    #[serde(default = "case_sensitive_default")]
    pub case_sensitive: bool,
}

fn case_sensitive_default() -> bool {
    true
}

/// Predicate tree.
///
/// An empty AND matches everything; an empty OR matches nothing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Query {
    And(Vec<Query>),
    Or(Vec<Query>),
    Filter(Filter),
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}

impl Query {
    pub fn and(items: Vec<Query>) -> Self {
        Self::And(items)
    }

    pub fn or(items: Vec<Query>) -> Self {
        Self::Or(items)
    }

    /// Matches every object.
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    pub fn filter(field: impl Into<String>, op: Operator, value: Value) -> Self {
        Self::Filter(Filter {
            field: field.into(),
            op,
            value,
            case_sensitive: true,
        })
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::filter(field, Operator::Equals, value)
    }

    pub fn ne(field: impl Into<String>, value: Value) -> Self {
        Self::filter(field, Operator::NotEquals, value)
    }

    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Self::filter(field, Operator::Gt, value)
    }

    pub fn lt(field: impl Into<String>, value: Value) -> Self {
        Self::filter(field, Operator::Lt, value)
    }

    pub fn is_in(field: impl Into<String>, value: Value) -> Self {
        Self::filter(field, Operator::In, value)
    }

    pub fn contains(field: impl Into<String>, value: Value) -> Self {
        Self::filter(field, Operator::Contains, value)
    }

    /// Make every leaf below this node case-insensitive.
    pub fn ignore_case(mut self) -> Self {
        self.set_case_sensitive(false);
        self
    }

    fn set_case_sensitive(&mut self, sensitive: bool) {
        match self {
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.set_case_sensitive(sensitive);
                }
            }
            Self::Filter(filter) => filter.case_sensitive = sensitive,
        }
    }

    /// Every leaf in tree order.
    pub fn filters(&self) -> Vec<&Filter> {
        let mut out = Vec::new();
        self.collect_filters(&mut out);
        out
    }

    fn collect_filters<'q>(&'q self, out: &mut Vec<&'q Filter>) {
        match self {
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.collect_filters(out);
                }
            }
            Self::Filter(filter) => out.push(filter),
        }
    }

    /// Evaluate against one candidate. `lookup` yields the current value of
    /// a field path, or `None` when a relation on the way is unset, which
    /// fails the leaf whatever its operator. AND and OR short-circuit.
    pub(crate) fn matches<F>(&self, lookup: &mut F) -> DalResult<bool>
    where
        F: FnMut(&str) -> DalResult<Option<Value>>,
    {
        match self {
            Self::And(items) => {
                for item in items {
                    if !item.matches(lookup)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or(items) => {
                for item in items {
                    if item.matches(lookup)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Filter(filter) => Ok(match lookup(&filter.field)? {
                Some(actual) => filter.test(&actual),
                None => false,
            }),
        }
    }
}

impl Filter {
    /// Apply the operator to a resolved field value.
    pub fn test(&self, actual: &Value) -> bool {
        let (actual, expected) = if self.case_sensitive {
            (actual.clone(), self.value.clone())
        } else {
            (lowercase(actual), lowercase(&self.value))
        };
        match self.op {
            Operator::Equals => loose_eq(&actual, &expected),
            Operator::NotEquals => !loose_eq(&actual, &expected),
            Operator::Gt => ordering(&actual, &expected) == Some(Ordering::Greater),
            Operator::Lt => ordering(&actual, &expected) == Some(Ordering::Less),
            Operator::In => match &expected {
                Value::Array(items) => items.iter().any(|item| loose_eq(&actual, item)),
                Value::String(haystack) => actual.as_str().is_some_and(|a| haystack.contains(a)),
                _ => false,
            },
            Operator::Contains => match &actual {
                Value::String(haystack) => expected.as_str().is_some_and(|e| haystack.contains(e)),
                Value::Array(items) => items.iter().any(|item| loose_eq(item, &expected)),
                _ => false,
            },
        }
    }
}

fn lowercase(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        Value::Array(items) => Value::Array(items.iter().map(lowercase).collect()),
        other => other.clone(),
    }
}

/// Equality where `1` and `1.0` are the same number.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Path compilation
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Step {
    Guid,
    Property { name: String, key: Option<String> },
    /// Traverse a forward relation; never last.
    Relation(String),
    RelationGuid(String),
    Dynamic(String),
    Foreign(String),
}

/// A compiled field path.
#[derive(Clone, Debug)]
pub(crate) struct Path {
    pub steps: Vec<Step>,
}

impl Path {
    /// Whether the value can be read from the row without an instance.
    pub fn is_shallow(&self) -> bool {
        matches!(
            self.steps.as_slice(),
            [Step::Guid] | [Step::Property { key: None, .. }] | [Step::RelationGuid(_)]
        )
    }

    /// Name of the plain property this path reads, if it is one.
    pub fn property(&self) -> Option<&str> {
        match self.steps.as_slice() {
            [Step::Property { name, key: None }] => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn is_guid(&self) -> bool {
        matches!(self.steps.as_slice(), [Step::Guid])
    }

    /// Read the value straight from a stored row.
    pub fn shallow_value(&self, guid: &str, row: &Row) -> DalResult<Option<Value>> {
        Ok(match self.steps.as_slice() {
            [Step::Guid] => Some(json!(guid)),
            [Step::Property { name, key: None }] => {
                Some(row.get(name).cloned().unwrap_or(Value::Null))
            }
            [Step::RelationGuid(name)] => Some(json!(cell_guid(row, name)?.map(|g| g.to_string()))),
            _ => None,
        })
    }
}

/// Everything a query needs to know about the schema before it runs.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// Storage type name to the fields whose change must evict the result.
    pub references: BTreeMap<String, BTreeSet<String>>,
    pub uses_dynamic: bool,
    pub paths: HashMap<String, Path>,
}

impl Plan {
    pub fn path(&self, field: &str) -> DalResult<&Path> {
        self.paths
            .get(field)
            .ok_or_else(|| DalError::InvalidQuery(format!("uncompiled field {field}")))
    }

    fn reference(&mut self, type_name: &str, field: &str) {
        self.references
            .entry(type_name.to_string())
            .or_default()
            .insert(field.to_string());
    }
}

/// Compile every field path of `query` against `hybrid`.
pub(crate) fn plan(dal: &Dal, hybrid: &Hybrid, query: &Query) -> DalResult<Plan> {
    let mut plan = Plan::default();
    plan.reference(hybrid.type_name().as_str(), ALL_FIELDS);
    for filter in query.filters() {
        if filter.op == Operator::In && !matches!(filter.value, Value::Array(_) | Value::String(_)) {
            return Err(DalError::InvalidQuery(format!(
                "IN on {} needs a list or a string",
                filter.field
            )));
        }
        if plan.paths.contains_key(&filter.field) {
            continue;
        }
        let path = compile(dal, hybrid, &filter.field, &mut plan)?;
        plan.paths.insert(filter.field.clone(), path);
    }
    Ok(plan)
}

fn compile(dal: &Dal, root: &Hybrid, field: &str, plan: &mut Plan) -> DalResult<Path> {
    let segments: Vec<&str> = field.split('.').collect();
    let mut steps = Vec::with_capacity(segments.len());
    let mut current = None;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        let hybrid: &Hybrid = current.as_deref().unwrap_or(root);
        let type_name = hybrid.type_name().as_str().to_string();
        let invalid = |why: &str| DalError::InvalidQuery(format!("{field}: {why} at '{segment}'"));

        if *segment == "guid" {
            if !last {
                return Err(invalid("guid must be the last segment"));
            }
            steps.push(Step::Guid);
            break;
        }
        let (name, key) = split_key(segment).ok_or_else(|| invalid("malformed key access"))?;
        match hybrid.attribute(name) {
            Some(Attribute::Property(_)) => {
                if !last {
                    return Err(invalid("cannot traverse a property"));
                }
                plan.reference(&type_name, name);
                steps.push(Step::Property {
                    name: name.to_string(),
                    key: key.map(str::to_string),
                });
            }
            Some(Attribute::Relation(relation)) => {
                plan.reference(&type_name, name);
                if last {
                    steps.push(Step::RelationGuid(name.to_string()));
                } else {
                    steps.push(Step::Relation(name.to_string()));
                    current = Some(dal.resolve(relation.target())?);
                }
            }
            Some(Attribute::Dynamic(_)) => {
                if !last {
                    return Err(invalid("cannot traverse a dynamic"));
                }
                plan.uses_dynamic = true;
                steps.push(Step::Dynamic(name.to_string()));
            }
            Some(Attribute::Foreign(foreign)) => {
                if !last {
                    return Err(invalid("cannot traverse a reverse relation"));
                }
                plan.reference(foreign.child_type_name.as_str(), &foreign.child_key);
                steps.push(Step::Foreign(name.to_string()));
            }
            None => {
                let relation = name
                    .strip_suffix("_guid")
                    .filter(|base| hybrid.relation(base).is_some());
                match relation {
                    Some(base) if last && key.is_none() => {
                        plan.reference(&type_name, base);
                        steps.push(Step::RelationGuid(base.to_string()));
                    }
                    _ => return Err(invalid("unknown attribute")),
                }
            }
        }
    }
    Ok(Path { steps })
}

/// `name[key]` into `("name", Some("key"))`.
fn split_key(segment: &str) -> Option<(&str, Option<&str>)> {
    match segment.split_once('[') {
        None => Some((segment, None)),
        Some((name, rest)) => {
            let key = rest.strip_suffix(']')?;
            if name.is_empty() || key.is_empty() {
                return None;
            }
            Some((name, Some(key)))
        }
    }
}

/// Look `key` up inside a dict (or a list, by position).
pub(crate) fn keyed(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) => map.remove(key).unwrap_or(Value::Null),
        Value::Array(mut items) => match key.parse::<usize>() {
            Ok(i) if i < items.len() => items.swap_remove(i),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

/// Content hash naming a cached result.
pub(crate) fn cache_hash(hybrid: &Hybrid, query: &Query, guids: Option<&[String]>) -> DalResult<String> {
    let identity = json!({
        "object": hybrid.name(),
        "query": query,
        "guids": guids,
    });
    let encoded = serde_json::to_vec(&identity)?;
    Ok(blake3::hash(&encoded).to_hex().to_string())
}
