//! Content-derived rule names.

use std::collections::BTreeMap;

use smol_str::SmolStr;
use xxhash_rust::xxh3::Xxh3;

/// Name a rule after the hash of its variables.
///
/// The name only depends on the variable contents, so identical command
/// templates declared from unrelated places end up sharing one rule.
pub fn rule_name(prefix: &str, variables: &BTreeMap<SmolStr, String>) -> SmolStr {
    let mut hasher = Xxh3::new();
    for (name, value) in variables {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.as_bytes());
        hasher.update(&[0]);
    }
    SmolStr::from(format!("{prefix}{:016x}", hasher.digest()))
}
