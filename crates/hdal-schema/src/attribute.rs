//! Attribute descriptors: the closed set of fields a type may carry.

use std::fmt;

use hdal_types::{canonical_string, TypeName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Declared value type of a property or dynamic.
///
/// `null` is accepted by every variant; mandatory-ness is checked at save
/// time, not here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Str,
    Int,
    /// Accepts integers as well.
    Float,
    Bool,
    List,
    Dict,
    /// Closed set of allowed values.
    Enum(Vec<Value>),
}

/// Why a value was rejected by [`PropertyType::check`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeCheckFailure {
    pub allowed: Vec<String>,
    pub given: String,
}

impl PropertyType {
    /// Names of the accepted JSON kinds, for error messages.
    pub fn allowed(&self) -> Vec<String> {
        match self {
            Self::Str => vec!["str".into()],
            Self::Int => vec!["int".into()],
            Self::Float => vec!["float".into(), "int".into()],
            Self::Bool => vec!["bool".into()],
            Self::List => vec!["list".into()],
            Self::Dict => vec!["dict".into()],
            Self::Enum(values) => values.iter().map(canonical_string).collect(),
        }
    }

    /// Check a value against this type.
    pub fn check(&self, value: &Value) -> Result<(), TypeCheckFailure> {
        let correct = match (self, value) {
            (_, Value::Null) => true,
            (Self::Enum(values), v) => enum_contains(values, v),
            (Self::Str, Value::String(_)) => true,
            (Self::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::List, Value::Array(_)) => true,
            (Self::Dict, Value::Object(_)) => true,
            _ => false,
        };
        if correct {
            Ok(())
        } else {
            let given = match self {
                Self::Enum(_) => canonical_string(value),
                _ => kind_of(value).to_string(),
            };
            Err(TypeCheckFailure {
                allowed: self.allowed(),
                given,
            })
        }
    }

    /// Whether values of this type can key a forward index bucket.
    pub fn indexable(&self) -> bool {
        matches!(
            self,
            Self::Str | Self::Int | Self::Float | Self::Bool | Self::Enum(_)
        )
    }

    /// Whether values of this type can be claimed by a uniqueness key.
    pub fn claimable(&self) -> bool {
        matches!(self, Self::Str | Self::Int | Self::Float | Self::Enum(_))
    }
}

fn enum_contains(values: &[Value], value: &Value) -> bool {
    // String enums compare on the canonical string form, so `1` matches "1".
    let stringly = matches!(values.first(), Some(Value::String(_)));
    if stringly {
        let wanted = canonical_string(value);
        values.iter().any(|v| canonical_string(v) == wanted)
    } else {
        values.iter().any(|v| v == value)
    }
}

/// Short JSON kind name of a value.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enum(_) => write!(f, "enum[{}]", self.allowed().join(", ")),
            Self::Str => f.write_str("str"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Bool => f.write_str("bool"),
            Self::List => f.write_str("list"),
            Self::Dict => f.write_str("dict"),
        }
    }
}

fn yes() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Property
// ---------------------------------------------------------------------------

/// Simple typed field stored in the object row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: PropertyType,
    #[serde(default = "yes")]
    pub mandatory: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl Property {
    /// Mandatory property with no default.
    pub fn new(name: impl Into<String>, ty: PropertyType) -> Self {
        Self {
            name: name.into(),
            ty,
            mandatory: true,
            default: None,
            unique: false,
            indexed: false,
            doc: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Value a fresh object starts with.
    pub fn initial_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Relation
// ---------------------------------------------------------------------------

/// Cardinality of a relation, seen from the child that holds the pointer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Many children may point at one parent; the parent sees a list.
    #[default]
    OneToMany,
    /// At most one child points at a parent; the parent sees a single object.
    OneToOne,
}

/// Pointer from a child object to one parent object.
///
/// The stored cell is `{type, identifier, guid}`; a null guid means unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    /// Declared target type; `None` points at the declaring type itself.
    #[serde(default)]
    pub foreign_type: Option<String>,
    /// Name of the reverse collection installed on the target.
    pub foreign_key: String,
    #[serde(default = "yes")]
    pub mandatory: bool,
    #[serde(default)]
    pub kind: RelationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(skip)]
    pub(crate) target: String,
}

impl Relation {
    /// Mandatory one-to-many relation to `foreign_type`.
    pub fn new(
        name: impl Into<String>,
        foreign_type: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            foreign_type: Some(foreign_type.into()),
            foreign_key: foreign_key.into(),
            mandatory: true,
            kind: RelationKind::OneToMany,
            doc: None,
            target: String::new(),
        }
    }

    /// Relation pointing at the declaring type.
    pub fn to_self(name: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        let mut relation = Self::new(name, String::new(), foreign_key);
        relation.foreign_type = None;
        relation
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn one_to_one(mut self) -> Self {
        self.kind = RelationKind::OneToOne;
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Logical name of the resolved target type. Empty before build.
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Reverse collection on a parent, derived from a child type's [`Relation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignRelation {
    /// Collection name on the parent (the relation's `foreign_key`).
    pub name: String,
    /// Logical name of the child type.
    pub child: String,
    /// Storage name of the child type.
    pub child_type_name: TypeName,
    /// Relation name on the child that points back here.
    pub child_key: String,
    /// `true` for one-to-many (a list), `false` for one-to-one.
    pub list: bool,
}

// ---------------------------------------------------------------------------
// Dynamic
// ---------------------------------------------------------------------------

/// Computed property with a volatile-cache TTL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dynamic {
    pub name: String,
    pub return_type: PropertyType,
    /// Cache lifetime in seconds; zero or less disables caching.
    #[serde(alias = "ttl")]
    pub ttl_secs: i64,
    /// Compute under a distributed mutex.
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl Dynamic {
    pub fn new(name: impl Into<String>, return_type: PropertyType, ttl_secs: i64) -> Self {
        Self {
            name: name.into(),
            return_type,
            ttl_secs,
            locked: false,
            doc: None,
        }
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn caches(&self) -> bool {
        self.ttl_secs > 0
    }
}

/// Any attribute of a resolved type, by reference.
#[derive(Clone, Copy, Debug)]
pub enum Attribute<'a> {
    Property(&'a Property),
    Relation(&'a Relation),
    Dynamic(&'a Dynamic),
    Foreign(&'a ForeignRelation),
}

impl Attribute<'_> {
    pub fn name(&self) -> &str {
        match self {
            Self::Property(p) => &p.name,
            Self::Relation(r) => &r.name,
            Self::Dynamic(d) => &d.name,
            Self::Foreign(f) => &f.name,
        }
    }
}
