//! Shell-style variable expansion for `--path` and `--exclude` values
//!
//! Supports `$NAME`, `${NAME}` and a leading `~`. Unset variables expand to
//! the empty string; a `$` not followed by a name is kept as is.

/// Expand `value` with variables from `lookup`.
pub fn expand_with<F>(value: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    if rest == "~" || rest.starts_with("~/") {
        if let Some(home) = lookup("HOME") {
            out.push_str(&home);
            rest = &rest[1..];
        }
    }

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            let end = braced
                .find('}')
                .ok_or_else(|| format!("unterminated ${{ in {value:?}"))?;
            let name = &braced[..end];
            if !is_name(name) {
                return Err(format!("bad substitution ${{{name}}} in {value:?}"));
            }
            out.push_str(&lookup(name).unwrap_or_default());
            rest = &braced[end + 1..];
            continue;
        }

        let len = after
            .char_indices()
            .find(|&(i, c)| !(c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())))
            .map_or(after.len(), |(i, _)| i);
        if len == 0 {
            out.push('$');
        } else {
            out.push_str(&lookup(&after[..len]).unwrap_or_default());
        }
        rest = &after[len..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Expand `value` from the process environment.
pub fn expand_env(value: &str) -> Result<String, String> {
    expand_with(value, |name| std::env::var(name).ok())
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
