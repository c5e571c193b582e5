// src/flexible_json.rs

use serde_json::{Map, Number, Value};
use tracing::debug;

/// Containers nested deeper than this are rejected by the literal evaluator.
const MAX_DEPTH: usize = 128;

#[derive(Debug, thiserror::Error)]
#[error("could not parse payload as JSON: {reason}")]
pub struct ParseError {
    reason: String,
}

/// Parse near-valid JSON text into a `Value`.
///
/// Strategies, first success wins:
/// 1. strict JSON;
/// 2. bare keys quoted and single-quoted strings rewritten, then strict JSON;
/// 3. a literal-only evaluator for Python-style containers
///    (`True`/`None`, tuples, trailing commas, single quotes).
///
/// Valid JSON always takes path 1, so already-correct input parses exactly
/// as `serde_json` would parse it.
pub fn parse(text: &str) -> Result<Value, ParseError> {
    let text = text.trim();

    let strict_err = match serde_json::from_str::<Value>(text) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let repaired = repair_quotes(text, QuoteMode::Convert);
    if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
        debug!("Parsed payload after key-quoting repair");
        return Ok(value);
    }

    // Blunt variant: every single quote becomes a double quote.
    let blunt = repair_quotes(text, QuoteMode::Keep).replace('\'', "\"");
    if let Ok(value) = serde_json::from_str::<Value>(&blunt) {
        debug!("Parsed payload after key-quoting repair (blunt quotes)");
        return Ok(value);
    }

    match literal::evaluate(text) {
        Ok(value) => {
            debug!("Parsed payload with literal evaluator");
            Ok(value)
        }
        Err(literal_err) => Err(ParseError {
            reason: format!("{strict_err}; literal fallback: {literal_err}"),
        }),
    }
}

/// Strip ASCII/C1 control characters. Newlines and tabs become spaces,
/// carriage returns are dropped.
pub fn clean_control_characters(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '\n' | '\t' => Some(' '),
            '\r' => None,
            c if is_control(c) => None,
            c => Some(c),
        })
        .collect()
}

/// Undo one level of quote escaping (`\"` -> `"`).
pub fn unescape_quotes(text: &str) -> String {
    text.replace("\\\"", "\"")
}

fn is_control(c: char) -> bool {
    matches!(c as u32, 0x00..=0x1F | 0x7F..=0x9F)
}

#[derive(Clone, Copy, PartialEq)]
enum QuoteMode {
    /// Rewrite `'...'` tokens as JSON strings.
    Convert,
    /// Copy single-quoted tokens verbatim.
    Keep,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Quote bare identifiers that are followed by `:` and sit outside any
/// quoted token.
fn repair_quotes(text: &str, mode: QuoteMode) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '"' || (c == '\'' && mode == QuoteMode::Keep) {
            i = copy_quoted(&chars, i, &mut out);
            continue;
        }

        if c == '\'' {
            i = convert_single_quoted(&chars, i, &mut out);
            continue;
        }

        if is_ident_start(c) && (i == 0 || !is_ident_char(chars[i - 1])) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();

            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if chars.get(j) == Some(&':') {
                out.push('"');
                out.push_str(&ident);
                out.push('"');
            } else {
                out.push_str(&ident);
            }
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

/// Copy a quoted token starting at `start` unchanged; returns the index after it.
fn copy_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        if c == '\\' {
            if let Some(&next) = chars.get(i + 1) {
                out.push(next);
            }
            i += 2;
            continue;
        }
        i += 1;
        if c == quote {
            break;
        }
    }
    i
}

/// Emit a `'...'` token as a `"..."` JSON string.
fn convert_single_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => match chars.get(i + 1) {
                Some('\'') => {
                    out.push('\'');
                    i += 2;
                }
                Some(&next) => {
                    out.push('\\');
                    out.push(next);
                    i += 2;
                }
                None => {
                    out.push('\\');
                    i += 1;
                }
            },
            '\'' => {
                out.push('"');
                return i + 1;
            }
            '"' => {
                out.push_str("\\\"");
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    // Unterminated: leave it for the strict parser to reject.
    i
}

/// Literal-only evaluator. Accepts containers and scalars, never names,
/// calls, operators or attribute access.
mod literal {
    use super::{MAX_DEPTH, Map, Number, Value};

    pub(super) fn evaluate(text: &str) -> Result<Value, String> {
        let mut parser = Parser {
            chars: text.chars().collect(),
            pos: 0,
            depth: 0,
        };
        let value = parser.value()?;
        parser.skip_ws();
        if parser.pos < parser.chars.len() {
            return Err(format!("trailing characters at offset {}", parser.pos));
        }
        Ok(value)
    }

    struct Parser {
        chars: Vec<char>,
        pos: usize,
        depth: usize,
    }

    impl Parser {
        fn peek(&self) -> Option<char> {
            self.chars.get(self.pos).copied()
        }

        fn skip_ws(&mut self) {
            while self.peek().is_some_and(char::is_whitespace) {
                self.pos += 1;
            }
        }

        fn expect(&mut self, wanted: char) -> Result<(), String> {
            self.skip_ws();
            match self.peek() {
                Some(c) if c == wanted => {
                    self.pos += 1;
                    Ok(())
                }
                Some(c) => Err(format!(
                    "expected '{wanted}' but found '{c}' at offset {}",
                    self.pos
                )),
                None => Err(format!("expected '{wanted}' but input ended")),
            }
        }

        fn value(&mut self) -> Result<Value, String> {
            self.skip_ws();
            match self.peek() {
                Some('{') => self.dict(),
                Some('[') => self.sequence(']').map(|(items, _)| Value::Array(items)),
                Some('(') => self.tuple(),
                Some('"') | Some('\'') => self.strings().map(Value::String),
                Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.') => self.number(),
                Some(c) if c.is_ascii_alphabetic() || c == '_' => self.keyword(),
                Some(c) => Err(format!("unexpected '{c}' at offset {}", self.pos)),
                None => Err("unexpected end of input".to_string()),
            }
        }

        fn enter(&mut self) -> Result<(), String> {
            self.depth += 1;
            if self.depth > MAX_DEPTH {
                return Err(format!("nesting deeper than {MAX_DEPTH}"));
            }
            Ok(())
        }

        fn dict(&mut self) -> Result<Value, String> {
            self.enter()?;
            self.pos += 1;
            let mut map = Map::new();
            loop {
                self.skip_ws();
                if self.peek() == Some('}') {
                    self.pos += 1;
                    break;
                }
                let key = match self.value()? {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(true) => "True".to_string(),
                    Value::Bool(false) => "False".to_string(),
                    Value::Null => "None".to_string(),
                    _ => return Err(format!("unhashable key at offset {}", self.pos)),
                };
                self.expect(':')?;
                let value = self.value()?;
                map.insert(key, value);

                self.skip_ws();
                match self.peek() {
                    Some(',') => self.pos += 1,
                    Some('}') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(format!("expected ',' or '}}' at offset {}", self.pos)),
                }
            }
            self.depth -= 1;
            Ok(Value::Object(map))
        }

        /// Items up to `close`; also reports whether a separating comma was seen.
        fn sequence(&mut self, close: char) -> Result<(Vec<Value>, bool), String> {
            self.enter()?;
            self.pos += 1;
            let mut items = Vec::new();
            let mut saw_comma = false;
            loop {
                self.skip_ws();
                if self.peek() == Some(close) {
                    self.pos += 1;
                    break;
                }
                items.push(self.value()?);
                self.skip_ws();
                match self.peek() {
                    Some(',') => {
                        saw_comma = true;
                        self.pos += 1;
                    }
                    Some(c) if c == close => {
                        self.pos += 1;
                        break;
                    }
                    _ => {
                        return Err(format!("expected ',' or '{close}' at offset {}", self.pos));
                    }
                }
            }
            self.depth -= 1;
            Ok((items, saw_comma))
        }

        fn tuple(&mut self) -> Result<Value, String> {
            let (mut items, saw_comma) = self.sequence(')')?;
            // `(x)` is a parenthesized value, `(x,)` a one-element tuple.
            if items.len() == 1 && !saw_comma {
                return Ok(items.remove(0));
            }
            Ok(Value::Array(items))
        }

        /// One or more adjacent string literals, concatenated.
        fn strings(&mut self) -> Result<String, String> {
            let mut out = self.string()?;
            loop {
                let save = self.pos;
                self.skip_ws();
                match self.peek() {
                    Some('"') | Some('\'') => out.push_str(&self.string()?),
                    _ => {
                        self.pos = save;
                        return Ok(out);
                    }
                }
            }
        }

        fn string(&mut self) -> Result<String, String> {
            let quote = self.chars[self.pos];
            let start = self.pos;
            self.pos += 1;
            let mut out = String::new();
            loop {
                let Some(c) = self.peek() else {
                    return Err(format!("unterminated string starting at offset {start}"));
                };
                self.pos += 1;
                match c {
                    c if c == quote => return Ok(out),
                    '\n' => return Err(format!("newline inside string at offset {}", self.pos)),
                    '\\' => self.escape(&mut out)?,
                    c => out.push(c),
                }
            }
        }

        fn escape(&mut self, out: &mut String) -> Result<(), String> {
            let Some(c) = self.peek() else {
                return Err("dangling backslash".to_string());
            };
            self.pos += 1;
            match c {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                '0' => out.push('\0'),
                '\\' | '\'' | '"' | '/' => out.push(c),
                '\n' => {}
                'x' => out.push(self.hex_char(2)?),
                'u' => out.push(self.hex_char(4)?),
                'U' => out.push(self.hex_char(8)?),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
            Ok(())
        }

        fn hex_char(&mut self, len: usize) -> Result<char, String> {
            let end = self.pos + len;
            if end > self.chars.len() {
                return Err("truncated escape sequence".to_string());
            }
            let digits: String = self.chars[self.pos..end].iter().collect();
            self.pos = end;
            u32::from_str_radix(&digits, 16)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| format!("invalid escape '{digits}'"))
        }

        fn number(&mut self) -> Result<Value, String> {
            let start = self.pos;
            let mut raw = String::new();
            if let Some(sign @ ('-' | '+')) = self.peek() {
                if sign == '-' {
                    raw.push('-');
                }
                self.pos += 1;
            }
            while let Some(c) = self.peek() {
                let exponent_sign =
                    matches!(c, '+' | '-') && matches!(raw.chars().last(), Some('e' | 'E'));
                if c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E') || exponent_sign {
                    raw.push(c);
                } else if c != '_' {
                    break;
                }
                self.pos += 1;
            }

            let is_float = raw.contains(['.', 'e', 'E']);
            let number = if is_float {
                raw.parse::<f64>().ok().and_then(Number::from_f64)
            } else {
                raw.parse::<i64>()
                    .map(Number::from)
                    .or_else(|_| raw.parse::<u64>().map(Number::from))
                    .ok()
                    .or_else(|| raw.parse::<f64>().ok().and_then(Number::from_f64))
            };
            number
                .map(Value::Number)
                .ok_or_else(|| format!("invalid number at offset {start}"))
        }

        fn keyword(&mut self) -> Result<Value, String> {
            let start = self.pos;
            while self
                .peek()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                self.pos += 1;
            }
            let word: String = self.chars[start..self.pos].iter().collect();
            match word.as_str() {
                "True" | "true" => Ok(Value::Bool(true)),
                "False" | "false" => Ok(Value::Bool(false)),
                "None" | "null" => Ok(Value::Null),
                other => Err(format!("'{other}' is not a literal")),
            }
        }
    }
}
