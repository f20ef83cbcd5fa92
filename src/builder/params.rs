use std::collections::BTreeMap;

use camino::Utf8Path;

use crate::builder::template;
use crate::error::TemplateError;

/// Parameter values loaded from a file.
///
/// Two formats are understood: a JSON object of scalar values, recognized by
/// its leading `{`, and everything else read as a properties file with
/// `name=value` or `name: value` lines and `#` or `!` comments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterFile {
    values: BTreeMap<String, String>,
}

impl ParameterFile {
    /// Reads and parses a parameter file. `${name}` placeholders in it are
    /// first replaced with the given variables.
    pub fn read(path: &Utf8Path, variables: &BTreeMap<String, String>) -> Result<Self, TemplateError> {
        let text = std::fs::read_to_string(path).map_err(|cause| TemplateError::Io {
            path: path.to_owned(),
            cause,
        })?;

        tracing::debug!(%path, "reading parameter file");
        Self::parse(&template::substitute(&text, variables))
    }

    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        if text.trim_start().starts_with('{') {
            Self::parse_json(text)
        } else {
            Self::parse_properties(text)
        }
    }

    fn parse_json(text: &str) -> Result<Self, TemplateError> {
        use serde_json::Value;

        let map: serde_json::Map<String, Value> = serde_json::from_str(text)
            .map_err(|err| TemplateError::ParameterFile(err.to_string()))?;

        let values = map
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    Value::Null => String::new(),
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => Ok(s.clone()),
                            Value::Number(_) | Value::Bool(_) => Ok(item.to_string()),
                            _ => Err(TemplateError::ParameterFile(format!("'{name}' must be a list of scalars"))),
                        })
                        .collect::<Result<Vec<_>, _>>()?
                        .join(","),
                    Value::Object(_) => {
                        return Err(TemplateError::ParameterFile(format!("'{name}' must be a scalar")));
                    }
                };
                Ok((name, value))
            })
            .collect::<Result<_, TemplateError>>()?;

        Ok(Self { values })
    }

    fn parse_properties(text: &str) -> Result<Self, TemplateError> {
        let mut values = BTreeMap::new();
        let mut lines = text.lines().enumerate();

        while let Some((number, line)) = lines.next() {
            let mut line = line.trim_start().to_string();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            // a trailing unescaped backslash joins the next line
            while ends_with_continuation(&line) {
                line.pop();
                match lines.next() {
                    Some((_, next)) => line.push_str(next.trim_start()),
                    None => break,
                }
            }

            let Some(split) = find_separator(&line) else {
                return Err(TemplateError::ParameterFile(format!(
                    "line {}: expected 'name=value', found '{}'",
                    number + 1,
                    line.trim()
                )));
            };

            let name = unescape(line[..split].trim());
            let value = unescape(line[split + 1..].trim());
            values.insert(name, value);
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

fn find_separator(line: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '=' | ':' => return Some(i),
            _ => {}
        }
    }
    None
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

/// Merges invocation parameters over the values of a parameter file.
pub fn merge_parameters(
    file: Option<&ParameterFile>,
    invocation: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = file.map(|file| file.values.clone()).unwrap_or_default();
    merged.extend(invocation.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
