use crate::error::{ExchangeError, Result};

/// Substitutes `$VAR` / `${VAR...}` references in a compose value using
/// `lookup` for the deploying environment.
pub fn interpolate<F>(input: &str, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((start, '{')) => {
                chars.next();
                let body_start = start + 1;
                let mut body_end = None;
                let mut depth = 1;
                for (i, ch) in chars.by_ref() {
                    match ch {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                body_end = Some(i);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                let body_end = body_end.ok_or_else(|| {
                    ExchangeError::Deploy(format!("unterminated variable reference in '{input}'"))
                })?;
                out.push_str(&expand_braced(&input[body_start..body_end], lookup)?);
            }
            Some((start, ch)) if ch == '_' || ch.is_ascii_alphabetic() => {
                let mut end = start;
                while let Some(&(i, ch)) = chars.peek() {
                    if ch == '_' || ch.is_ascii_alphanumeric() {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&input[start..end]).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    Ok(out)
}

fn expand_braced<F>(body: &str, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let name_len = body
        .find(|c: char| !(c == '_' || c.is_ascii_alphanumeric()))
        .unwrap_or(body.len());
    let (name, rest) = body.split_at(name_len);
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(ExchangeError::Deploy(format!(
            "invalid variable reference '${{{body}}}'"
        )));
    }

    let value = lookup(name);
    let missing = |message: &str| {
        let message = if message.is_empty() {
            format!("required variable {name} is missing a value")
        } else {
            format!("{name}: {message}")
        };
        Err(ExchangeError::Deploy(message))
    };

    if rest.is_empty() {
        return Ok(value.unwrap_or_default());
    }
    if let Some(default) = rest.strip_prefix(":-") {
        return match value {
            Some(v) if !v.is_empty() => Ok(v),
            _ => interpolate(default, lookup),
        };
    }
    if let Some(default) = rest.strip_prefix('-') {
        return match value {
            Some(v) => Ok(v),
            None => interpolate(default, lookup),
        };
    }
    if let Some(message) = rest.strip_prefix(":?") {
        return match value {
            Some(v) if !v.is_empty() => Ok(v),
            _ => missing(message),
        };
    }
    if let Some(message) = rest.strip_prefix('?') {
        return match value {
            Some(v) => Ok(v),
            None => missing(message),
        };
    }
    Err(ExchangeError::Deploy(format!(
        "invalid variable reference '${{{body}}}'"
    )))
}

/// True when the value contains a variable reference rather than only literal text.
pub fn has_reference(input: &str) -> bool {
    let unescaped = input.replace("$$", "");
    unescaped.contains('$')
}
