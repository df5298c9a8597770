//! Splits template source into text and action segments, then tokenizes
//! the inside of each action.

use serde_json::Number;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Text(String),
    Action { tokens: Vec<Token>, line: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// Bare identifier: keyword or helper name.
    Ident(String),
    /// `.`, `.Field` or `.A.B`. An empty path is the dot itself.
    Field(Vec<String>),
    /// `.Field` directly following `)`.
    Chain(Vec<String>),
    /// `$`, `$x` or `$x.Field`.
    Variable(String, Vec<String>),
    Str(String),
    Number(Number),
    Bool(bool),
    Nil,
    Pipe,
    LParen,
    RParen,
    Declare,
    Assign,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LexError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

pub(crate) fn segments(source: &str) -> Result<Vec<Segment>, LexError> {
    let mut out: Vec<Segment> = Vec::new();
    let mut rest = source;
    let mut line = 1usize;
    let mut trim_next_text = false;

    while !rest.is_empty() {
        let Some(open) = rest.find(OPEN) else {
            push_text(&mut out, rest, trim_next_text);
            break;
        };

        let mut text = &rest[..open];
        let after_open = &rest[open + OPEN.len()..];
        let trim_left = after_open.starts_with('-')
            && after_open[1..].starts_with(|c: char| c.is_ascii_whitespace());
        if trim_left {
            text = text.trim_end();
        }
        push_text(&mut out, text, trim_next_text);
        line += rest[..open].matches('\n').count();

        let body_start = if trim_left { 1 } else { 0 };
        let body_src = &after_open[body_start..];
        let close = find_close(body_src).ok_or_else(|| LexError {
            line,
            message: "unclosed action".to_string(),
        })?;

        let mut body = &body_src[..close];
        let trim_right = body.ends_with('-')
            && body[..body.len() - 1].ends_with(|c: char| c.is_ascii_whitespace());
        if trim_right {
            body = &body[..body.len() - 1];
        }

        let trimmed = body.trim();
        if trimmed.starts_with("/*") {
            if !trimmed.ends_with("*/") {
                return Err(LexError {
                    line,
                    message: "unclosed comment".to_string(),
                });
            }
        } else {
            let tokens = tokenize(trimmed, line)?;
            if tokens.is_empty() {
                return Err(LexError {
                    line,
                    message: "missing value for command".to_string(),
                });
            }
            out.push(Segment::Action { tokens, line });
        }

        line += body_src[..close].matches('\n').count();
        trim_next_text = trim_right;
        rest = &body_src[close + CLOSE.len()..];
    }

    Ok(out)
}

fn push_text(out: &mut Vec<Segment>, text: &str, trim_start: bool) {
    let text = if trim_start { text.trim_start() } else { text };
    if !text.is_empty() {
        out.push(Segment::Text(text.to_string()));
    }
}

/// Finds the closing `}}` of an action, skipping quoted strings and comments.
fn find_close(body: &str) -> Option<usize> {
    let trimmed_offset = body.len() - body.trim_start().len();
    if body[trimmed_offset..].starts_with("/*") {
        let end = body[trimmed_offset..].find("*/")? + trimmed_offset + 2;
        return body[end..].find(CLOSE).map(|i| i + end);
    }

    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    i += 1;
                }
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn tokenize(body: &str, line: usize) -> Result<Vec<Token>, LexError> {
    let err = |message: String| LexError { line, message };
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
                if chars.get(i) == Some(&'.') {
                    let (path, next) = read_path(&chars, i);
                    if path.is_empty() {
                        return Err(err("bad field chain after ')'".to_string()));
                    }
                    tokens.push(Token::Chain(path));
                    i = next;
                }
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Declare);
                i += 2;
            }
            '=' => {
                tokens.push(Token::Assign);
                i += 1;
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(err("unterminated quoted string".to_string()));
                    };
                    i += 1;
                    match ch {
                        '"' => break,
                        '\\' => {
                            let Some(&esc) = chars.get(i) else {
                                return Err(err("unterminated quoted string".to_string()));
                            };
                            i += 1;
                            value.push(match esc {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                '\\' => '\\',
                                '"' => '"',
                                '\'' => '\'',
                                other => {
                                    return Err(err(format!("unknown escape sequence: \\{}", other)));
                                }
                            });
                        }
                        other => value.push(other),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .ok_or_else(|| err("unterminated raw quoted string".to_string()))?;
                tokens.push(Token::Str(chars[start..start + end].iter().collect()));
                i = start + end + 1;
            }
            '.' => {
                if chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                    return Err(err("bad number syntax".to_string()));
                }
                let (path, next) = read_path(&chars, i);
                tokens.push(Token::Field(path));
                i = next;
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let (path, next) = if chars.get(end) == Some(&'.') {
                    read_path(&chars, end)
                } else {
                    (Vec::new(), end)
                };
                tokens.push(Token::Variable(name, path));
                i = next;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || ((chars[i] == '-' || chars[i] == '+')
                            && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(parse_number(&text).ok_or_else(|| {
                    err(format!("bad number syntax: {}", text))
                })?));
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "nil" => Token::Nil,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(err(format!("unexpected character {:?} in action", other))),
        }
    }

    Ok(tokens)
}

fn read_path(chars: &[char], mut i: usize) -> (Vec<String>, usize) {
    let mut path = Vec::new();
    while chars.get(i) == Some(&'.') {
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && is_ident_char(chars[end]) {
            end += 1;
        }
        if end == start {
            // A lone dot.
            return (path, start);
        }
        path.push(chars[start..end].iter().collect());
        i = end;
    }
    (path, i)
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(value) = text.parse::<i64>() {
        return Some(Number::from(value));
    }
    text.parse::<f64>().ok().and_then(Number::from_f64)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
