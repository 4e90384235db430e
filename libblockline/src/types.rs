//! Type engine.
//!
//! Base casters turn the text of a hinted scalar into a [`Value`]. Composed
//! types, declared in a `types` block as `(name) = (base=constraint) ...`,
//! validate tuple rows field by field. Failures never abort a parse: they
//! come back as a [`TypeError`] next to the raw text.

use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use indexmap::IndexMap;
use num_bigint::BigInt;
use std::fmt;
use thiserror::Error;

use crate::scanner::unescape;
use crate::value::Value;

/// Built-in scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Int,
    Float,
    Decimal,
    Bool,
    String,
    Null,
    Date,
    Time,
    DateTime,
    Uuid,
    Bin,
    Hex,
    B64,
    Regex,
    Enum,
    Any,
}

impl BaseType {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "int" => BaseType::Int,
            "float" => BaseType::Float,
            "decimal" => BaseType::Decimal,
            "bool" => BaseType::Bool,
            "string" => BaseType::String,
            "null" => BaseType::Null,
            "date" => BaseType::Date,
            "time" => BaseType::Time,
            "datetime" => BaseType::DateTime,
            "uuid" => BaseType::Uuid,
            "bin" => BaseType::Bin,
            "hex" => BaseType::Hex,
            "b64" => BaseType::B64,
            "regex" => BaseType::Regex,
            "enum" => BaseType::Enum,
            "any" => BaseType::Any,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            BaseType::Int => "int",
            BaseType::Float => "float",
            BaseType::Decimal => "decimal",
            BaseType::Bool => "bool",
            BaseType::String => "string",
            BaseType::Null => "null",
            BaseType::Date => "date",
            BaseType::Time => "time",
            BaseType::DateTime => "datetime",
            BaseType::Uuid => "uuid",
            BaseType::Bin => "bin",
            BaseType::Hex => "hex",
            BaseType::B64 => "b64",
            BaseType::Regex => "regex",
            BaseType::Enum => "enum",
            BaseType::Any => "any",
        }
    }

    /// Parse the unescaped text of a scalar.
    /// `arg` is the part after `:` in hints such as `(enum:red|green)`.
    fn parse(self, text: &str, arg: Option<&str>) -> std::result::Result<Value, String> {
        match self {
            BaseType::Int => {
                let digits: String = text.chars().filter(|c| *c != '_').collect();
                let body = digits.strip_prefix('-').unwrap_or(&digits);
                if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
                    return Err("not an integer".into());
                }
                digits
                    .parse::<BigInt>()
                    .map(Value::Integer)
                    .map_err(|e| e.to_string())
            }
            BaseType::Float => match text {
                "nan" => Ok(Value::Float(f64::NAN)),
                "inf" => Ok(Value::Float(f64::INFINITY)),
                "-inf" => Ok(Value::Float(f64::NEG_INFINITY)),
                _ => text
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|e| e.to_string()),
            },
            BaseType::Decimal => {
                if is_decimal(text) {
                    Ok(Value::Decimal(text.to_string()))
                } else {
                    Err("not a decimal".into())
                }
            }
            BaseType::Bool => match text {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err("expected true or false".into()),
            },
            BaseType::String | BaseType::Any => Ok(Value::String(text.to_string())),
            BaseType::Null => match text {
                "" | "null" => Ok(Value::Null),
                _ => Err("expected null".into()),
            },
            BaseType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| e.to_string()),
            BaseType::Time => NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map(Value::Time)
                .map_err(|e| e.to_string()),
            BaseType::DateTime => DateTime::parse_from_rfc3339(text)
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                        .map(|naive| naive.and_utc().fixed_offset())
                })
                .map(Value::DateTime)
                .map_err(|e| e.to_string()),
            BaseType::Uuid => parse_uuid(text).map(Value::Uuid),
            BaseType::Bin => parse_bin(text).map(Value::Bytes),
            BaseType::Hex => hex::decode(text)
                .map(Value::Bytes)
                .map_err(|e| e.to_string()),
            BaseType::B64 => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map(Value::Bytes)
                .map_err(|e| e.to_string()),
            BaseType::Regex => regex::Regex::new(text)
                .map(|_| Value::String(text.to_string()))
                .map_err(|e| e.to_string()),
            BaseType::Enum => {
                let ident = !text.is_empty()
                    && text
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
                if !ident {
                    return Err("not an enum member".into());
                }
                match arg {
                    Some(members) if !members.split('|').any(|m| m == text) => {
                        Err(format!("not one of {}", members))
                    }
                    _ => Ok(Value::String(text.to_string())),
                }
            }
        }
    }

    /// Check a cast value against a composed-type constraint.
    ///
    /// Numeric types constrain the value itself; byte types the byte count;
    /// everything else the character count of the text.
    fn satisfies(self, value: &Value, text: &str, constraint: Constraint) -> bool {
        match (self, value) {
            (BaseType::Int, Value::Integer(n)) => constraint.admits_int(n),
            (BaseType::Float, Value::Float(f)) => constraint.admits_f64(*f),
            (BaseType::Decimal, _) => text
                .parse::<f64>()
                .map(|f| constraint.admits_f64(f))
                .unwrap_or(false),
            (_, Value::Bytes(b)) => constraint.admits_len(b.len() as u64),
            (_, Value::String(s)) => constraint.admits_len(s.chars().count() as u64),
            _ => constraint.admits_len(text.chars().count() as u64),
        }
    }
}

fn is_decimal(text: &str) -> bool {
    let body = text.strip_prefix('-').unwrap_or(text);
    let (whole, frac) = match body.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (body, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(whole) && frac.map_or(true, digits)
}

fn parse_uuid(text: &str) -> std::result::Result<[u8; 16], String> {
    let groups: Vec<&str> = text.split('-').collect();
    let lengths: Vec<usize> = groups.iter().map(|g| g.len()).collect();
    if lengths != [8, 4, 4, 4, 12] {
        return Err("expected 8-4-4-4-12 hex groups".into());
    }
    let mut out = [0u8; 16];
    hex::decode_to_slice(groups.concat(), &mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

fn parse_bin(text: &str) -> std::result::Result<Vec<u8>, String> {
    if text.len() % 8 != 0 || !text.bytes().all(|b| b == b'0' || b == b'1') {
        return Err("expected groups of eight binary digits".into());
    }
    text.as_bytes()
        .chunks(8)
        .map(|chunk| {
            let bits = std::str::from_utf8(chunk).map_err(|e| e.to_string())?;
            u8::from_str_radix(bits, 2).map_err(|e| e.to_string())
        })
        .collect()
}

/// Field constraint of a composed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// `N`
    Exact(u64),
    /// `A-B`, inclusive.
    Range(u64, u64),
    /// `N.`, open-ended.
    AtLeast(u64),
}

impl Constraint {
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(min) = s.strip_suffix('.') {
            return min.parse().ok().map(Constraint::AtLeast);
        }
        if let Some((lo, hi)) = s.split_once('-') {
            let (lo, hi) = (lo.parse().ok()?, hi.parse().ok()?);
            return (lo <= hi).then_some(Constraint::Range(lo, hi));
        }
        s.parse().ok().map(Constraint::Exact)
    }

    fn admits_len(self, n: u64) -> bool {
        match self {
            Constraint::Exact(e) => n == e,
            Constraint::Range(lo, hi) => lo <= n && n <= hi,
            Constraint::AtLeast(lo) => n >= lo,
        }
    }

    fn admits_int(self, n: &BigInt) -> bool {
        match self {
            Constraint::Exact(e) => *n == BigInt::from(e),
            Constraint::Range(lo, hi) => BigInt::from(lo) <= *n && *n <= BigInt::from(hi),
            Constraint::AtLeast(lo) => *n >= BigInt::from(lo),
        }
    }

    fn admits_f64(self, f: f64) -> bool {
        match self {
            Constraint::Exact(e) => f == e as f64,
            Constraint::Range(lo, hi) => lo as f64 <= f && f <= hi as f64,
            Constraint::AtLeast(lo) => f >= lo as f64,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Exact(n) => write!(f, "{}", n),
            Constraint::Range(lo, hi) => write!(f, "{}-{}", lo, hi),
            Constraint::AtLeast(n) => write!(f, "{}.", n),
        }
    }
}

/// One positional field of a composed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub base: BaseType,
    pub constraint: Option<Constraint>,
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.constraint {
            Some(c) => write!(f, "{}={}", self.base.name(), c),
            None => write!(f, "{}", self.base.name()),
        }
    }
}

/// A user-declared composed type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

/// What went wrong in a cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeErrorKind {
    /// The base caster rejected the text.
    Cast,
    /// The cast succeeded but a composed-type constraint failed.
    Constraint,
    /// A row has the wrong number of fields for its composed type.
    Arity,
    /// The hint names no base or declared type.
    UnknownType,
    /// A composed type was applied to something other than a row.
    NotARow,
}

/// Non-fatal cast failure attached to a node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", self.describe())]
pub struct TypeError {
    pub kind: TypeErrorKind,
    /// Hint or composed type name that was applied.
    pub type_name: String,
    /// Field index for composed-type failures.
    pub field: Option<usize>,
    /// What was expected, e.g. `int=0-99`.
    pub expected: String,
    /// The offending text.
    pub actual: String,
}

impl TypeError {
    fn describe(&self) -> String {
        let scope = match self.field {
            Some(i) => format!("field {} of ({})", i, self.type_name),
            None => format!("({})", self.type_name),
        };
        match self.kind {
            TypeErrorKind::Cast | TypeErrorKind::Constraint => {
                format!("{}: expected {}, got \"{}\"", scope, self.expected, self.actual)
            }
            TypeErrorKind::Arity => {
                format!("{}: expected {} fields, got {}", scope, self.expected, self.actual)
            }
            TypeErrorKind::UnknownType => format!("unknown type \"{}\"", self.type_name),
            TypeErrorKind::NotARow => {
                format!("{}: composed type applied to a non-row value", scope)
            }
        }
    }
}

/// Outcome of casting one scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Cast {
    /// Cast value, or the unescaped text when the cast failed.
    pub value: Value,
    pub type_tag: String,
    pub error: Option<TypeError>,
}

impl Cast {
    fn untyped(raw: &str) -> Self {
        Self {
            value: Value::String(unescape(raw)),
            type_tag: BaseType::String.name().to_string(),
            error: None,
        }
    }

    fn failed(raw: &str, type_tag: &str, error: TypeError) -> Self {
        Self {
            value: Value::String(unescape(raw)),
            type_tag: type_tag.to_string(),
            error: Some(error),
        }
    }
}

/// Outcome of casting a tuple row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowCast {
    /// Composed type name, when one applied.
    pub type_tag: Option<String>,
    /// Row-level failure (arity).
    pub error: Option<TypeError>,
    /// One entry per field; `None` for reference fields.
    pub fields: Vec<Option<Cast>>,
}

/// Split `enum:red|green` into the base name and its argument.
fn hint_parts(hint: &str) -> (&str, Option<&str>) {
    match hint.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (hint, None),
    }
}

/// Whether a hint names a base type, so it can be cast without the registry.
pub fn is_base_hint(hint: &str) -> bool {
    BaseType::from_name(hint_parts(hint).0).is_some()
}

/// Cast `raw` (escaped source text) with a base type.
fn cast_base(base: BaseType, arg: Option<&str>, hint: &str, raw: &str) -> Cast {
    match base.parse(&unescape(raw), arg) {
        Ok(value) => Cast {
            value,
            type_tag: base.name().to_string(),
            error: None,
        },
        Err(reason) => {
            let error = TypeError {
                kind: TypeErrorKind::Cast,
                type_name: hint.to_string(),
                field: None,
                expected: format!("{} ({})", hint, reason),
                actual: raw.to_string(),
            };
            Cast::failed(raw, base.name(), error)
        }
    }
}

/// Registry of composed types for one document.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: IndexMap<String, TypeDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Parse and register a declaration line: `(name) = (base=constraint) ...`.
    /// The error string explains what is wrong with the declaration.
    pub fn declare(&mut self, line: &str) -> std::result::Result<&TypeDef, String> {
        let def = parse_declaration(line)?;
        if BaseType::from_name(&def.name).is_some() {
            return Err(format!("\"{}\" shadows a base type", def.name));
        }
        if self.types.contains_key(&def.name) {
            return Err(format!("\"{}\" is already declared", def.name));
        }
        let name = def.name.clone();
        self.types.insert(name.clone(), def);
        Ok(&self.types[&name])
    }

    /// Cast a scalar in a non-row position.
    pub fn cast_scalar(&self, hint: Option<&str>, raw: &str) -> Cast {
        let Some(hint) = hint else {
            return Cast::untyped(raw);
        };
        let (name, arg) = hint_parts(hint);
        if let Some(base) = BaseType::from_name(name) {
            return cast_base(base, arg, hint, raw);
        }
        let kind = if self.types.contains_key(hint) {
            TypeErrorKind::NotARow
        } else {
            TypeErrorKind::UnknownType
        };
        let error = TypeError {
            kind,
            type_name: hint.to_string(),
            field: None,
            expected: hint.to_string(),
            actual: raw.to_string(),
        };
        Cast::failed(raw, hint, error)
    }

    /// Cast the fields of a row. `fields` holds the raw text of each field,
    /// `None` for reference fields. The hint comes from the first field.
    pub fn cast_row(&self, hint: Option<&str>, fields: &[Option<&str>]) -> RowCast {
        let Some(def) = hint.and_then(|h| self.types.get(h)) else {
            let fields = fields
                .iter()
                .copied()
                .enumerate()
                .map(|(i, f)| f.map(|raw| self.cast_scalar(if i == 0 { hint } else { None }, raw)))
                .collect();
            return RowCast {
                type_tag: None,
                error: None,
                fields,
            };
        };

        let error = (fields.len() != def.fields.len()).then(|| TypeError {
            kind: TypeErrorKind::Arity,
            type_name: def.name.clone(),
            field: Some(fields.len().min(def.fields.len())),
            expected: def.fields.len().to_string(),
            actual: fields.len().to_string(),
        });

        let casts = fields
            .iter()
            .copied()
            .enumerate()
            .map(|(i, f)| {
                let raw = f?;
                let Some(spec) = def.fields.get(i) else {
                    return Some(Cast::untyped(raw));
                };
                Some(self.cast_field(def, i, spec, raw))
            })
            .collect();

        RowCast {
            type_tag: Some(def.name.clone()),
            error,
            fields: casts,
        }
    }

    fn cast_field(&self, def: &TypeDef, index: usize, spec: &FieldSpec, raw: &str) -> Cast {
        let mut cast = cast_base(spec.base, None, spec.base.name(), raw);
        if let Some(err) = cast.error.as_mut() {
            err.type_name = def.name.clone();
            err.field = Some(index);
            err.expected = spec.to_string();
            return cast;
        }
        if let Some(constraint) = spec.constraint {
            if !spec.base.satisfies(&cast.value, &unescape(raw), constraint) {
                let error = TypeError {
                    kind: TypeErrorKind::Constraint,
                    type_name: def.name.clone(),
                    field: Some(index),
                    expected: spec.to_string(),
                    actual: raw.to_string(),
                };
                return Cast::failed(raw, spec.base.name(), error);
            }
        }
        cast
    }
}

/// Parse `(name) = (base=constraint) (base=constraint) ...`.
fn parse_declaration(line: &str) -> std::result::Result<TypeDef, String> {
    let (head, body) = line
        .split_once('=')
        .ok_or_else(|| "expected \"(name) = ...\"".to_string())?;
    let name = head
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("bad type name \"{}\"", head.trim()))?;

    let mut fields = Vec::new();
    let mut rest = body.trim();
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('(')
            .ok_or_else(|| format!("expected \"(\" at \"{}\"", rest))?;
        let close = inner
            .find(')')
            .ok_or_else(|| "unterminated field spec".to_string())?;
        fields.push(parse_field_spec(inner[..close].trim())?);
        rest = inner[close + 1..].trim_start();
    }
    if fields.is_empty() {
        return Err(format!("type \"{}\" has no fields", name));
    }

    Ok(TypeDef {
        name: name.to_string(),
        fields,
    })
}

fn parse_field_spec(spec: &str) -> std::result::Result<FieldSpec, String> {
    let (base, constraint) = match spec.split_once('=') {
        Some((b, c)) => (b.trim(), Some(c.trim())),
        None => (spec, None),
    };
    let base = BaseType::from_name(base).ok_or_else(|| format!("unknown base type \"{}\"", base))?;
    let constraint = match constraint {
        Some(c) => Some(Constraint::parse(c).ok_or_else(|| format!("bad constraint \"{}\"", c))?),
        None => None,
    };
    Ok(FieldSpec { base, constraint })
}
