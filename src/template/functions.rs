//! The fixed helper table available to templates.
//!
//! Helpers are resolved at parse time. A template naming anything outside
//! this table fails to parse, so rendering never looks up code by a
//! user-supplied name.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};
use chrono::format::{Item, StrftimeItems};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Helper {
    HasVar,
    GetVar,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Contains,
    HasPrefix,
    HasSuffix,
    Join,
    Split,
    Replace,
    Json,
    Default,
    FormatDate,
    Now,
    AddDays,
    Upper,
    Lower,
    Title,
    Trim,
    IsLast,
    Len,
    Index,
    Print,
    Printf,
    Println,
}

impl Helper {
    pub(crate) fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "hasVar" => Helper::HasVar,
            "getVar" => Helper::GetVar,
            "eq" => Helper::Eq,
            "ne" => Helper::Ne,
            "lt" => Helper::Lt,
            "le" => Helper::Le,
            "gt" => Helper::Gt,
            "ge" => Helper::Ge,
            "and" => Helper::And,
            "or" => Helper::Or,
            "not" => Helper::Not,
            "contains" => Helper::Contains,
            "hasPrefix" => Helper::HasPrefix,
            "hasSuffix" => Helper::HasSuffix,
            "join" => Helper::Join,
            "split" => Helper::Split,
            "replace" => Helper::Replace,
            "json" | "marshalJSON" => Helper::Json,
            "default" => Helper::Default,
            "formatDate" => Helper::FormatDate,
            "now" => Helper::Now,
            "addDays" => Helper::AddDays,
            "upper" => Helper::Upper,
            "lower" => Helper::Lower,
            "title" => Helper::Title,
            "trim" => Helper::Trim,
            "isLast" => Helper::IsLast,
            "len" => Helper::Len,
            "index" => Helper::Index,
            "print" => Helper::Print,
            "printf" => Helper::Printf,
            "println" => Helper::Println,
            _ => return None,
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Helper::HasVar => "hasVar",
            Helper::GetVar => "getVar",
            Helper::Eq => "eq",
            Helper::Ne => "ne",
            Helper::Lt => "lt",
            Helper::Le => "le",
            Helper::Gt => "gt",
            Helper::Ge => "ge",
            Helper::And => "and",
            Helper::Or => "or",
            Helper::Not => "not",
            Helper::Contains => "contains",
            Helper::HasPrefix => "hasPrefix",
            Helper::HasSuffix => "hasSuffix",
            Helper::Join => "join",
            Helper::Split => "split",
            Helper::Replace => "replace",
            Helper::Json => "json",
            Helper::Default => "default",
            Helper::FormatDate => "formatDate",
            Helper::Now => "now",
            Helper::AddDays => "addDays",
            Helper::Upper => "upper",
            Helper::Lower => "lower",
            Helper::Title => "title",
            Helper::Trim => "trim",
            Helper::IsLast => "isLast",
            Helper::Len => "len",
            Helper::Index => "index",
            Helper::Print => "print",
            Helper::Printf => "printf",
            Helper::Println => "println",
        }
    }

    /// Accepted argument count as `(min, max)`.
    fn arity(&self) -> (usize, usize) {
        match self {
            Helper::Now => (0, 0),
            Helper::Not
            | Helper::Json
            | Helper::Upper
            | Helper::Lower
            | Helper::Title
            | Helper::Trim
            | Helper::Len => (1, 1),
            Helper::HasVar
            | Helper::Ne
            | Helper::Lt
            | Helper::Le
            | Helper::Gt
            | Helper::Ge
            | Helper::Contains
            | Helper::HasPrefix
            | Helper::HasSuffix
            | Helper::Join
            | Helper::Split
            | Helper::Default
            | Helper::FormatDate
            | Helper::AddDays
            | Helper::IsLast => (2, 2),
            Helper::GetVar | Helper::Replace => (3, 3),
            Helper::Eq => (2, usize::MAX),
            Helper::And | Helper::Or | Helper::Printf => (1, usize::MAX),
            Helper::Index => (1, usize::MAX),
            Helper::Print | Helper::Println => (0, usize::MAX),
        }
    }

    pub(crate) fn call(&self, args: Vec<Value>) -> Result<Value, String> {
        let (min, max) = self.arity();
        if args.len() < min || args.len() > max {
            return Err(format!(
                "wrong number of args for {}: got {}",
                self.name(),
                args.len()
            ));
        }

        let value = match self {
            Helper::HasVar => Value::Bool(match &args[0] {
                Value::Object(vars) => vars.contains_key(&display(&args[1])),
                _ => false,
            }),
            Helper::GetVar => match &args[0] {
                Value::Object(vars) => vars
                    .get(&display(&args[1]))
                    .cloned()
                    .unwrap_or_else(|| args[2].clone()),
                _ => args[2].clone(),
            },
            Helper::Eq => Value::Bool(args[1..].iter().any(|other| equals(&args[0], other))),
            Helper::Ne => Value::Bool(!equals(&args[0], &args[1])),
            Helper::Lt => Value::Bool(compare(&args[0], &args[1]) == Ordering::Less),
            Helper::Le => Value::Bool(compare(&args[0], &args[1]) != Ordering::Greater),
            Helper::Gt => Value::Bool(compare(&args[0], &args[1]) == Ordering::Greater),
            Helper::Ge => Value::Bool(compare(&args[0], &args[1]) != Ordering::Less),
            Helper::And => args
                .iter()
                .find(|v| !truthy(v))
                .or(args.last())
                .cloned()
                .unwrap_or(Value::Null),
            Helper::Or => args
                .iter()
                .find(|v| truthy(v))
                .or(args.last())
                .cloned()
                .unwrap_or(Value::Null),
            Helper::Not => Value::Bool(!truthy(&args[0])),
            Helper::Contains => Value::Bool(match &args[0] {
                Value::Array(items) => items.iter().any(|item| equals(item, &args[1])),
                Value::Object(map) => map.contains_key(&display(&args[1])),
                haystack => display(haystack).contains(&display(&args[1])),
            }),
            Helper::HasPrefix => Value::Bool(display(&args[0]).starts_with(&display(&args[1]))),
            Helper::HasSuffix => Value::Bool(display(&args[0]).ends_with(&display(&args[1]))),
            Helper::Join => {
                let (items, sep) = match (&args[0], &args[1]) {
                    (_, Value::Array(_)) if !args[0].is_array() => (&args[1], &args[0]),
                    _ => (&args[0], &args[1]),
                };
                let sep = display(sep);
                Value::String(match items {
                    Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(&sep),
                    Value::Null => String::new(),
                    other => display(other),
                })
            }
            Helper::Split => Value::Array(
                display(&args[0])
                    .split(display(&args[1]).as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ),
            Helper::Replace => Value::String(
                display(&args[0]).replace(display(&args[1]).as_str(), &display(&args[2])),
            ),
            Helper::Json => Value::String(
                serde_json::to_string(&args[0]).map_err(|e| format!("json: {}", e))?,
            ),
            Helper::Default => {
                if is_zero(&args[0]) {
                    args[1].clone()
                } else {
                    args[0].clone()
                }
            }
            Helper::FormatDate => {
                let (time, layout) = match (parse_time(&args[0]), parse_time(&args[1])) {
                    (Some(time), _) => (time, display(&args[1])),
                    (None, Some(time)) => (time, display(&args[0])),
                    (None, None) => return Err("formatDate: argument is not a time".to_string()),
                };
                Value::String(format_time(&time, &layout)?)
            }
            Helper::Now => Value::String(rfc3339(&Utc::now())),
            Helper::AddDays => {
                let (days, time) = match (as_number(&args[0]), parse_time(&args[1])) {
                    (Some(days), Some(time)) => (days, time),
                    _ => match (parse_time(&args[0]), as_number(&args[1])) {
                        (Some(time), Some(days)) => (days, time),
                        _ => return Err("addDays: expected a day count and a time".to_string()),
                    },
                };
                if !days.is_finite() || days.abs() > i64::MAX as f64 {
                    return Err("addDays: out of range".to_string());
                }
                let shifted = TimeDelta::try_days(days as i64)
                    .and_then(|delta| time.checked_add_signed(delta))
                    .ok_or_else(|| "addDays: out of range".to_string())?;
                Value::String(rfc3339(&shifted))
            }
            Helper::Upper => Value::String(display(&args[0]).to_uppercase()),
            Helper::Lower => Value::String(display(&args[0]).to_lowercase()),
            Helper::Title => Value::String(title_case(&display(&args[0]))),
            Helper::Trim => Value::String(display(&args[0]).trim().to_string()),
            Helper::IsLast => Value::Bool(match &args[0] {
                Value::Object(map) => map
                    .keys()
                    .max()
                    .is_some_and(|last| *last == display(&args[1])),
                _ => false,
            }),
            Helper::Len => Value::from(match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => return Err(format!("len of {}", type_name(other))),
            }),
            Helper::Index => {
                let mut current = args[0].clone();
                for key in &args[1..] {
                    current = index(&current, key)?;
                }
                current
            }
            Helper::Print => Value::String(sprint(&args)),
            Helper::Println => Value::String(format!(
                "{}\n",
                args.iter().map(display).collect::<Vec<_>>().join(" ")
            )),
            Helper::Printf => Value::String(sprintf(&display(&args[0]), &args[1..])?),
        };
        Ok(value)
    }
}

/// Go-style truthiness: zero values are false.
pub(crate) fn truthy(value: &Value) -> bool {
    !is_zero(value)
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Renders a value the way it appears in template output.
pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => format!(
            "[{}]",
            items.iter().map(display).collect::<Vec<_>>().join(" ")
        ),
        Value::Object(_) => value.to_string(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn equals(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => x == y,
            _ => display(a) == display(b),
        },
    }
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => display(a).cmp(&display(b)),
    }
}

fn index(collection: &Value, key: &Value) -> Result<Value, String> {
    match collection {
        Value::Array(items) => {
            let i = as_number(key).ok_or_else(|| "index: non-numeric list index".to_string())?;
            if i < 0.0 || i as usize >= items.len() {
                return Err(format!("index out of range: {}", i));
            }
            Ok(items[i as usize].clone())
        }
        Value::Object(map) => Ok(map.get(&display(key)).cloned().unwrap_or(Value::Null)),
        Value::Null => Ok(Value::Null),
        other => Err(format!("can't index item of type {}", type_name(other))),
    }
}

fn title_case(input: &str) -> String {
    let mut prev_is_space = true;
    input
        .chars()
        .map(|c| {
            let mapped = if prev_is_space {
                c.to_uppercase().collect::<String>()
            } else {
                c.to_string()
            };
            prev_is_space = c.is_whitespace();
            mapped
        })
        .collect()
}

fn sprint(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 && !args[i - 1].is_string() && !arg.is_string() {
            out.push(' ');
        }
        out.push_str(&display(arg));
    }
    out
}

fn sprintf(format: &str, args: &[Value]) -> Result<String, String> {
    let mut out = String::new();
    let mut args = args.iter();
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut precision: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut digits = String::new();
            while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                digits.push(*d);
                chars.next();
            }
            precision = digits.parse().ok();
        }

        let verb = chars
            .next()
            .ok_or_else(|| "printf: trailing %".to_string())?;
        if verb == '%' {
            out.push('%');
            continue;
        }

        let arg = args
            .next()
            .ok_or_else(|| format!("printf: missing argument for %{}", verb))?;
        match verb {
            's' | 'v' => out.push_str(&display(arg)),
            'q' => out.push_str(&Value::String(display(arg)).to_string()),
            't' => out.push_str(&truthy(arg).to_string()),
            'd' => {
                let n = as_number(arg).ok_or_else(|| "printf: %d of non-number".to_string())?;
                out.push_str(&(n.trunc() as i64).to_string());
            }
            'f' => {
                let n = as_number(arg).ok_or_else(|| "printf: %f of non-number".to_string())?;
                out.push_str(&format!("{:.*}", precision.unwrap_or(6), n));
            }
            other => return Err(format!("printf: unsupported verb %{}", other)),
        }
    }

    Ok(out)
}

pub(crate) fn rfc3339(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
            }),
        _ => None,
    }
}

const GO_LAYOUT_TOKENS: &[(&str, &str)] = &[
    ("January", "%B"),
    ("Monday", "%A"),
    ("2006", "%Y"),
    ("Z07:00", "%:z"),
    ("-0700", "%z"),
    ("Jan", "%b"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    (".000", "%.3f"),
    ("01", "%m"),
    ("02", "%d"),
    ("_2", "%e"),
    ("15", "%H"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("06", "%y"),
    ("PM", "%p"),
];

/// Formats with a strftime layout; layouts without `%` are read as Go
/// reference layouts (`2006-01-02 15:04:05`).
pub(crate) fn format_time(time: &DateTime<Utc>, layout: &str) -> Result<String, String> {
    let strftime = if layout.contains('%') {
        layout.to_string()
    } else {
        translate_go_layout(layout)
    };

    let items: Vec<Item<'_>> = StrftimeItems::new(&strftime).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(format!("formatDate: invalid layout {:?}", layout));
    }
    Ok(time.format_with_items(items.iter()).to_string())
}

fn translate_go_layout(layout: &str) -> String {
    let mut out = String::new();
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (token, replacement) in GO_LAYOUT_TOKENS {
            if let Some(stripped) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = stripped;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

pub(crate) fn object(pairs: impl IntoIterator<Item = (String, Value)>) -> Value {
    Value::Object(pairs.into_iter().collect::<Map<String, Value>>())
}
