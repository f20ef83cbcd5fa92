//! Structured node configuration and its binding to typed stage parameters.
//!
//! A node carries its configuration as a [`ConfigValue`] tree, exactly as it
//! appeared in the declarative graph text after template substitution. The
//! tree is only given meaning when it is bound against the parameters a stage
//! declares in its [`StageDescriptor`](crate::StageDescriptor), which converts
//! every entry to a typed [`ParameterValue`] and fills in stage defaults.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::error::BuildError;
use crate::stage::StageDescriptor;

/// A tree of configuration values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Scalar(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl Default for ConfigValue {
    fn default() -> Self {
        ConfigValue::Map(BTreeMap::new())
    }
}

impl ConfigValue {
    /// An empty map.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn scalar(value: impl Into<String>) -> Self {
        ConfigValue::Scalar(value.into())
    }

    pub fn child(&self, name: &str) -> Option<&ConfigValue> {
        match self {
            ConfigValue::Map(map) => map.get(name),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            ConfigValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Sets a child entry, turning this value into a map if it isn't one.
    pub fn set(&mut self, name: impl Into<String>, value: ConfigValue) -> &mut Self {
        if !matches!(self, ConfigValue::Map(_)) {
            *self = ConfigValue::empty();
        }

        if let ConfigValue::Map(map) = self {
            map.insert(name.into(), value);
        }

        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, ConfigValue::Scalar(value.into()));
        self
    }

    /// True for a scalar which is nothing but a `${name}` placeholder that no
    /// template variable replaced.
    pub fn is_unresolved(&self) -> bool {
        match self {
            ConfigValue::Scalar(value) => {
                let value = value.trim();
                value.starts_with("${") && value.ends_with('}') && value[2..value.len() - 1].find('}').is_none()
            }
            _ => false,
        }
    }

    pub fn is_empty_map(&self) -> bool {
        matches!(self, ConfigValue::Map(map) if map.is_empty())
    }
}

impl From<serde_json::Value> for ConfigValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => ConfigValue::Scalar(String::new()),
            Value::Bool(b) => ConfigValue::Scalar(b.to_string()),
            Value::Number(n) => ConfigValue::Scalar(n.to_string()),
            Value::String(s) => ConfigValue::Scalar(s),
            Value::Array(items) => ConfigValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                ConfigValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    String,
    Integer,
    Double,
    Boolean,
    StringList,
}

impl ParameterKind {
    /// Converts the textual form of a value.
    pub fn parse(self, text: &str) -> Result<ParameterValue, String> {
        let trimmed = text.trim();
        match self {
            ParameterKind::String => Ok(ParameterValue::String(text.to_string())),
            ParameterKind::Integer => trimmed
                .parse()
                .map(ParameterValue::Integer)
                .map_err(|_| format!("'{text}' is not an integer")),
            ParameterKind::Double => trimmed
                .parse()
                .map(ParameterValue::Double)
                .map_err(|_| format!("'{text}' is not a number")),
            ParameterKind::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Ok(ParameterValue::Boolean(true)),
                "false" => Ok(ParameterValue::Boolean(false)),
                _ => Err(format!("'{text}' is not a boolean")),
            },
            ParameterKind::StringList => Ok(ParameterValue::StringList(
                trimmed
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(String::from)
                    .collect(),
            )),
        }
    }

    /// Converts a configuration subtree.
    pub fn convert(self, value: &ConfigValue) -> Result<ParameterValue, String> {
        match (self, value) {
            (_, ConfigValue::Scalar(text)) => self.parse(text),
            (ParameterKind::StringList, ConfigValue::List(items)) => items
                .iter()
                .map(|item| {
                    item.as_scalar()
                        .map(String::from)
                        .ok_or_else(|| "list items must be scalars".to_string())
                })
                .collect::<Result<_, _>>()
                .map(ParameterValue::StringList),
            (_, ConfigValue::List(_)) => Err("expected a single value, found a list".into()),
            (_, ConfigValue::Map(_)) => Err("expected a single value, found a structure".into()),
        }
    }
}

impl Display for ParameterKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParameterKind::String => "String",
            ParameterKind::Integer => "int",
            ParameterKind::Double => "double",
            ParameterKind::Boolean => "boolean",
            ParameterKind::StringList => "String[]",
        };

        f.write_str(name)
    }
}

/// A typed, bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    String(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    StringList(Vec<String>),
}

impl Display for ParameterValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ParameterValue::String(s) => f.write_str(s),
            ParameterValue::Integer(i) => write!(f, "{i}"),
            ParameterValue::Double(d) => write!(f, "{d}"),
            ParameterValue::Boolean(b) => write!(f, "{b}"),
            ParameterValue::StringList(items) => f.write_str(&items.join(",")),
        }
    }
}

/// A parameter declared by a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    pub default: Option<ParameterValue>,
    pub description: Option<String>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            description: None,
        }
    }

    pub fn default_value(mut self, value: ParameterValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The typed parameter set handed to a stage at initialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundParameters {
    values: BTreeMap<String, ParameterValue>,
}

impl BoundParameters {
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.values.get(name)? {
            ParameterValue::Double(d) => Some(*d),
            ParameterValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            ParameterValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name)? {
            ParameterValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&[String]> {
        match self.values.get(name)? {
            ParameterValue::StringList(items) => Some(items),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn binding_error(node: &str, descriptor: &StageDescriptor, parameter: &str, reason: impl Into<String>) -> BuildError {
    BuildError::ParameterBinding {
        node: node.to_string(),
        stage: descriptor.name().to_string(),
        parameter: parameter.to_string(),
        reason: reason.into(),
    }
}

fn fill_defaults(descriptor: &StageDescriptor, values: &mut BTreeMap<String, ParameterValue>) {
    for spec in descriptor.parameters() {
        if !values.contains_key(&spec.name)
            && let Some(default) = &spec.default
        {
            values.insert(spec.name.clone(), default.clone());
        }
    }
}

/// Binds a node's configuration tree to the parameters its stage declares.
///
/// Entries that are missing, or that are still an unresolved `${name}`
/// placeholder, take the stage default. Unknown names and values which cannot
/// be converted fail the binding.
pub fn bind(
    node: &str,
    descriptor: &StageDescriptor,
    configuration: &ConfigValue,
) -> Result<BoundParameters, BuildError> {
    let mut values = BTreeMap::new();

    match configuration {
        ConfigValue::Map(map) => {
            for (name, value) in map {
                let spec = descriptor
                    .parameter(name)
                    .ok_or_else(|| binding_error(node, descriptor, name, "unknown parameter"))?;

                if value.is_unresolved() {
                    tracing::debug!(node, parameter = %name, "unresolved placeholder, using default");
                    continue;
                }

                let typed = spec
                    .kind
                    .convert(value)
                    .map_err(|reason| binding_error(node, descriptor, name, reason))?;

                values.insert(name.clone(), typed);
            }
        }
        ConfigValue::Scalar(text) if text.trim().is_empty() => {}
        _ => {
            return Err(binding_error(
                node,
                descriptor,
                "<configuration>",
                "configuration must be a structure of named values",
            ));
        }
    }

    fill_defaults(descriptor, &mut values);
    Ok(BoundParameters { values })
}

/// Binds raw textual `name=value` pairs, as supplied directly at invocation.
pub fn bind_raw(
    node: &str,
    descriptor: &StageDescriptor,
    raw: &BTreeMap<String, String>,
) -> Result<BoundParameters, BuildError> {
    let mut values = BTreeMap::new();

    for (name, text) in raw {
        let spec = descriptor
            .parameter(name)
            .ok_or_else(|| binding_error(node, descriptor, name, "unknown parameter"))?;

        let typed = spec
            .kind
            .parse(text)
            .map_err(|reason| binding_error(node, descriptor, name, reason))?;

        values.insert(name.clone(), typed);
    }

    fill_defaults(descriptor, &mut values);
    Ok(BoundParameters { values })
}
