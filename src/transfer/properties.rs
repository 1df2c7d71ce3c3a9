//! Line-oriented `key=value` properties text
//!
//! Follows the classic properties format: `#`/`!` comment lines, `=`, `:`
//! or whitespace between key and value, backslash escapes and backslash
//! line continuation.

use std::collections::HashMap;

/// Parse properties text into a map
///
/// Blank lines and lines starting with `#` or `!` are ignored. The key ends
/// at the first unescaped `=`, `:` or whitespace; whitespace around that
/// separator is skipped and the rest of the line is the value. A line
/// ending in an odd number of backslashes joins the next line with its
/// leading whitespace removed. `\t`, `\n`, `\r`, `\f` and `\uXXXX` are
/// decoded, any other escaped character stands for itself. Later keys win.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    logical_lines(text)
        .iter()
        .map(|line| {
            let (key, value) = split_entry(line);
            (unescape(key), unescape(value))
        })
        .collect()
}

fn is_blank(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\u{c}')
}

/// A trailing backslash continues the line unless it is itself escaped
fn continues(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

fn logical_lines(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let mut natural = normalized.split(['\n', '\r']);
    let mut logical = Vec::new();

    while let Some(first) = natural.next() {
        let mut current = first.trim_start_matches(is_blank);
        if current.is_empty() || current.starts_with(['#', '!']) {
            continue;
        }

        let mut joined = String::new();
        loop {
            if !continues(current) {
                joined.push_str(current);
                break;
            }
            joined.push_str(&current[..current.len() - 1]);
            match natural.next() {
                Some(next) => current = next.trim_start_matches(is_blank),
                None => break,
            }
        }
        logical.push(joined);
    }
    logical
}

/// Split a logical line into its raw (still escaped) key and value
fn split_entry(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (index, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => {
                let value = &line[index + c.len_utf8()..];
                return (&line[..index], value.trim_start_matches(is_blank));
            }
            c if is_blank(c) => {
                let rest = line[index..].trim_start_matches(is_blank);
                let rest = rest.strip_prefix(['=', ':']).unwrap_or(rest);
                return (&line[..index], rest.trim_start_matches(is_blank));
            }
            _ => {}
        }
    }
    (line, "")
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => match take_code_unit(&mut chars) {
                Some(unit) => {
                    let mut units = vec![unit];
                    if (0xD800..0xDC00).contains(&unit) {
                        let mut lookahead = chars.clone();
                        if lookahead.next() == Some('\\') && lookahead.next() == Some('u') {
                            if let Some(low) = take_code_unit(&mut lookahead) {
                                units.push(low);
                                chars = lookahead;
                            }
                        }
                    }
                    for decoded in char::decode_utf16(units) {
                        out.push(decoded.unwrap_or(char::REPLACEMENT_CHARACTER));
                    }
                }
                None => out.push('u'),
            },
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Consume four hex digits, leaving `chars` untouched if they are not there
fn take_code_unit(chars: &mut std::str::Chars<'_>) -> Option<u16> {
    let digits: String = chars.clone().take(4).collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let unit = u16::from_str_radix(&digits, 16).ok()?;
    for _ in 0..4 {
        chars.next();
    }
    Some(unit)
}
