use std::collections::{BTreeMap, BTreeSet};

/// Replaces every `${name}` with the value of the variable `name`.
///
/// Placeholders naming an unknown variable are left exactly as written, so a
/// later stage can still recognize them as unresolved. Substitution happens
/// on raw text, which means values may carry structure of their own.
pub fn substitute(text: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match variables.get(name.trim()) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Names of all `${name}` placeholders in the text, sorted and deduplicated.
pub fn placeholders(text: &str) -> BTreeSet<&str> {
    let mut names = BTreeSet::new();
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        names.insert(after[..end].trim());
        rest = &after[end + 1..];
    }

    names
}
