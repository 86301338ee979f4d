//! Variable substitution for build-file arguments.
//!
//! Supports `$NAME`, `${NAME}`, `${NAME:-default}`, `${NAME:+alternate}`
//! and `\$` escapes. A plain reference to a name without a value is an
//! error; the `:-`/`:+` forms never fail.

/// Why an expansion failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandError {
    /// Referenced name has no value
    Undefined(String),
    /// Unterminated or malformed `${...}`
    Malformed(String),
}

/// Expand variable references in `input` using `lookup`.
pub fn expand<F>(input: &str, lookup: F) -> Result<String, ExpandError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some((_, '$'))) => {
                out.push('$');
                chars.next();
            }
            '$' => match chars.peek().copied() {
                Some((start, '{')) => {
                    chars.next();
                    let close = input[start..]
                        .find('}')
                        .map(|offset| start + offset)
                        .ok_or_else(|| ExpandError::Malformed(input[start - 1..].to_string()))?;
                    let body = &input[start + 1..close];
                    out.push_str(&expand_braced(body, &lookup)?);
                    while chars.peek().is_some_and(|(idx, _)| *idx <= close) {
                        chars.next();
                    }
                }
                Some((start, ch)) if is_name_start(ch) => {
                    let mut end = start;
                    while let Some(&(idx, ch)) = chars.peek() {
                        if !is_name_char(ch) {
                            break;
                        }
                        end = idx + ch.len_utf8();
                        chars.next();
                    }
                    let name = &input[start..end];
                    let value =
                        lookup(name).ok_or_else(|| ExpandError::Undefined(name.to_string()))?;
                    out.push_str(&value);
                }
                _ => out.push('$'),
            },
            other => out.push(other),
        }
    }

    Ok(out)
}

fn expand_braced<F>(body: &str, lookup: &F) -> Result<String, ExpandError>
where
    F: Fn(&str) -> Option<String>,
{
    let (name, modifier) = match body.find(':') {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };

    if !is_valid_name(name) {
        return Err(ExpandError::Malformed(format!("${{{}}}", body)));
    }

    let value = lookup(name).filter(|v| !v.is_empty());
    match modifier {
        None => lookup(name).ok_or_else(|| ExpandError::Undefined(name.to_string())),
        Some(m) if m.starts_with('-') => Ok(value.unwrap_or_else(|| m[1..].to_string())),
        Some(m) if m.starts_with('+') => Ok(value.map(|_| m[1..].to_string()).unwrap_or_default()),
        Some(_) => Err(ExpandError::Malformed(format!("${{{}}}", body))),
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_valid_name(name: &str) -> bool {
    name.chars().next().is_some_and(is_name_start) && name.chars().all(is_name_char)
}
