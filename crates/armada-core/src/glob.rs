//! Shell-style globs over unit names.
//!
//! `*` matches any run of characters except `/`, `?` one such character,
//! `[...]` a character class (`[!...]` or `[^...]` negated, ranges allowed),
//! and `\x` the literal `x`. Patterns are compiled to anchored regexes.

use regex::Regex;

use crate::error::{UnitError, UnitResult};

/// Match `name` against a glob `pattern`.
pub fn glob_match(pattern: &str, name: &str) -> UnitResult<bool> {
    let re = compile(pattern)?;
    Ok(re.is_match(name))
}

/// Compile a glob into an anchored [`Regex`].
pub fn compile(pattern: &str) -> UnitResult<Regex> {
    let source = translate(pattern)?;
    Regex::new(&source).map_err(|e| UnitError::Glob {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

fn translate(pattern: &str) -> UnitResult<String> {
    let err = |reason: &str| UnitError::Glob {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' => {
                let escaped = chars.next().ok_or_else(|| err("trailing backslash"))?;
                out.push_str(&regex::escape(&escaped.to_string()));
            }
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    out.push('^');
                }
                let mut empty = true;
                loop {
                    let Some(c) = chars.next() else {
                        return Err(err("unterminated character class"));
                    };
                    match c {
                        ']' if !empty => break,
                        '\\' => {
                            let escaped = chars.next().ok_or_else(|| err("trailing backslash"))?;
                            push_class_char(&mut out, escaped);
                        }
                        '-' if !empty && chars.peek() != Some(&']') => out.push('-'),
                        c => push_class_char(&mut out, c),
                    }
                    empty = false;
                }
                out.push(']');
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Ok(out)
}

fn push_class_char(out: &mut String, c: char) {
    if matches!(c, '\\' | '[' | ']' | '^' | '&' | '~' | '-') {
        out.push('\\');
    }
    out.push(c);
}
