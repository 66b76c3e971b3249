//! Selection metadata
//!
//! Describes the shape of the data being written or read: fields, their
//! arguments, nested selections, and type-conditioned fragments. These types
//! are produced by a code generator; they carry no parsing logic and can be
//! deserialized from JSON fixtures.
//!
//! The addressing unit inside a record is the *field storage key*: the field
//! name, followed by its identity-relevant arguments serialized as canonical
//! JSON, e.g. `height({"unit":"FOOT"})`. Aliases never take part in it.

mod collect;

pub use collect::{collect_fields, CollectedField};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operation variables
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// A field selected in an operation or fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledField {
    pub name: String,

    #[serde(default)]
    pub alias: Option<String>,

    /// Named type of a composite field (object, interface or union)
    #[serde(default)]
    pub type_name: Option<String>,

    #[serde(default)]
    pub arguments: Vec<CompiledArgument>,

    #[serde(default)]
    pub selections: Vec<Selection>,

    /// `@include`/`@skip` conditions, all of which must pass
    #[serde(default)]
    pub condition: Vec<Condition>,
}

impl CompiledField {
    /// A scalar field with no arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            type_name: None,
            arguments: Vec::new(),
            selections: Vec::new(),
            condition: Vec::new(),
        }
    }

    /// A composite field of the given named type
    pub fn object(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            type_name: Some(type_name.into()),
            ..Self::new(name)
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_argument(mut self, argument: CompiledArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn with_selections(mut self, selections: Vec<Selection>) -> Self {
        self.selections = selections;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition.push(condition);
        self
    }

    /// Key of this field in response data: alias if present, else name
    pub fn response_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Whether this field has a sub-selection
    pub fn is_composite(&self) -> bool {
        !self.selections.is_empty()
    }

    /// All arguments with variables substituted
    ///
    /// Arguments whose variable is not provided are omitted.
    pub fn resolve_arguments(&self, variables: &Variables) -> BTreeMap<String, serde_json::Value> {
        self.arguments
            .iter()
            .filter_map(|arg| arg.value.resolve(variables).map(|v| (arg.name.clone(), v)))
            .collect()
    }

    /// The field storage key used inside records
    ///
    /// Pagination arguments do not take part in the key.
    pub fn storage_key(&self, variables: &Variables) -> String {
        let arguments: BTreeMap<_, _> = self
            .arguments
            .iter()
            .filter(|arg| !arg.pagination)
            .filter_map(|arg| arg.value.resolve(variables).map(|v| (arg.name.clone(), v)))
            .collect();

        if arguments.is_empty() {
            return self.name.clone();
        }

        let arguments = serde_json::Value::Object(arguments.into_iter().collect());
        format!("{}({})", self.name, canonical_json(&arguments))
    }
}

/// A field argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledArgument {
    pub name: String,
    pub value: ArgumentValue,

    /// Pagination arguments are excluded from the field storage key
    #[serde(default)]
    pub pagination: bool,
}

impl CompiledArgument {
    /// An argument with a literal value
    pub fn literal(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value: ArgumentValue::Literal(value),
            pagination: false,
        }
    }

    /// An argument bound to an operation variable
    pub fn variable(name: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ArgumentValue::Variable(variable.into()),
            pagination: false,
        }
    }

    /// Mark as a pagination argument
    pub fn pagination(mut self) -> Self {
        self.pagination = true;
        self
    }
}

/// Argument value as written in the operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentValue {
    Literal(serde_json::Value),
    Variable(String),
    Object(BTreeMap<String, ArgumentValue>),
    List(Vec<ArgumentValue>),
}

impl ArgumentValue {
    /// Substitute variables
    ///
    /// # Returns
    /// `None` for a top-level variable that is not provided. Missing variables
    /// nested in objects drop the entry; in lists they become null.
    pub fn resolve(&self, variables: &Variables) -> Option<serde_json::Value> {
        match self {
            ArgumentValue::Literal(value) => Some(value.clone()),
            ArgumentValue::Variable(name) => variables.get(name).cloned(),
            ArgumentValue::Object(fields) => Some(serde_json::Value::Object(
                fields
                    .iter()
                    .filter_map(|(k, v)| v.resolve(variables).map(|v| (k.clone(), v)))
                    .collect(),
            )),
            ArgumentValue::List(items) => Some(serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| v.resolve(variables).unwrap_or(serde_json::Value::Null))
                    .collect(),
            )),
        }
    }
}

/// An `@include(if: $var)` or `@skip(if: $var)` condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,

    /// `true` for `@skip`
    #[serde(default)]
    pub inverted: bool,
}

impl Condition {
    pub fn include_if(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            inverted: false,
        }
    }

    pub fn skip_if(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            inverted: true,
        }
    }

    /// Evaluate against variables; a missing variable counts as `false`
    pub fn passes(&self, variables: &Variables) -> bool {
        let value = variables
            .get(&self.variable)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        value != self.inverted
    }
}

/// A fragment spread or inline fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFragment {
    /// Concrete typenames the fragment applies to; empty means unconditional
    #[serde(default)]
    pub possible_types: Vec<String>,

    pub selections: Vec<Selection>,

    #[serde(default)]
    pub condition: Vec<Condition>,
}

impl CompiledFragment {
    /// Whether the fragment applies to an object of the given runtime type
    pub fn applies_to(&self, typename: &str) -> bool {
        self.possible_types.is_empty() || self.possible_types.iter().any(|t| t == typename)
    }
}

/// One entry of a selection set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Field(CompiledField),
    Fragment(CompiledFragment),
}

impl Selection {
    /// A scalar field with no arguments
    pub fn field(name: impl Into<String>) -> Self {
        Selection::Field(CompiledField::new(name))
    }

    /// A type-conditioned fragment
    pub fn fragment<I, S>(possible_types: I, selections: Vec<Selection>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::Fragment(CompiledFragment {
            possible_types: possible_types.into_iter().map(Into::into).collect(),
            selections,
            condition: Vec::new(),
        })
    }
}

impl From<CompiledField> for Selection {
    fn from(field: CompiledField) -> Self {
        Selection::Field(field)
    }
}

/// A top-level operation; its fields live on the `QUERY_ROOT` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,

    /// Root typename ("Query", "Mutation", "Subscription")
    #[serde(default = "default_root_type")]
    pub root_type: String,

    pub selections: Vec<Selection>,
}

fn default_root_type() -> String {
    "Query".to_string()
}

impl Operation {
    /// A query operation
    pub fn query(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            name: name.into(),
            root_type: default_root_type(),
            selections,
        }
    }

    /// A mutation operation
    pub fn mutation(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            name: name.into(),
            root_type: "Mutation".to_string(),
            selections,
        }
    }
}

/// A named fragment read from or written to an arbitrary record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub name: String,
    pub type_name: String,
    pub selections: Vec<Selection>,
}

impl Fragment {
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        selections: Vec<Selection>,
    ) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            selections,
        }
    }
}

/// Serialize JSON with object keys sorted at every level
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        serde_json::Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{}]", body)
        }
        other => other.to_string(),
    }
}
