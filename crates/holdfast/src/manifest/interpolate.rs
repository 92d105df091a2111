//! `${var}` interpolation of Provision variables into Service/Stack fields.
//!
//! Interpolation is total: every `${...}` reference found in a string must
//! resolve against the supplied variable map, or [`interpolate`] returns an
//! error naming the unresolved variable. There is no silent passthrough of
//! an unresolved placeholder, since a half-substituted compose value would
//! be worse than a loud failure at resolve time.

use std::collections::BTreeMap;

use anyhow::{Result, bail};

/// Replace every `${name}` occurrence in `input` with `vars[name]`.
pub fn interpolate(input: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            let Some(close) = input[i + 2..].find('}') else {
                bail!("unterminated ${{...}} placeholder starting at byte {i}");
            };
            let name = &input[i + 2..i + 2 + close];
            match vars.get(name) {
                Some(value) => out.push_str(value),
                None => bail!("unresolved variable '{name}' referenced in manifest"),
            }
            i += 2 + close + 1;
        } else {
            let ch = input[i..].chars().next().expect("i < bytes.len()");
            out.push(ch);
            i += ch.len_utf8();
        }
    }

    Ok(out)
}

/// Interpolate every value in a flat string map in place, erroring on the
/// first unresolved reference.
pub fn interpolate_map(
    input: &BTreeMap<String, String>,
    vars: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    input
        .iter()
        .map(|(k, v)| Ok((k.clone(), interpolate(v, vars)?)))
        .collect()
}
