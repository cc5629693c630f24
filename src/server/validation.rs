//! Declarative request-body checks that run before any handler logic.
//!
//! Each route declares a slice of [`Rule`]s. Rules are evaluated in order and
//! a field stops being checked after its first failure, so the response holds
//! at most one error per field. Sanitizers run as part of the same pass: text is
//! trimmed, emails are lowercased, numeric strings become numbers and dates are
//! normalised to RFC 3339 so the typed payload can deserialize them directly.

use crate::server::error::{AppError, FieldError};
use axum::{
    async_trait,
    extract::{FromRequest, Request},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy)]
pub enum Check {
    /// Present and non-empty once trimmed.
    Required,
    MinLength(usize),
    Email,
    /// A JSON number or a string that parses as one.
    Numeric,
    Positive,
    /// ISO 8601 date or datetime.
    Date,
    FutureDate,
    /// Absent or null passes; otherwise the inner check applies.
    Optional(&'static Check),
    /// Array of objects, each checked against the nested rules. Absent or null passes.
    Each(&'static [Rule]),
    Array,
    NonEmptyArray,
    OneOf(&'static [&'static str]),
    /// Only digits (spaces ignored), length within the inclusive range.
    Digits(usize, usize),
    /// Card expiry in `MM/YY` form.
    Expiry,
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub field: &'static str,
    pub check: Check,
    pub msg: &'static str,
}

pub const fn rule(field: &'static str, check: Check, msg: &'static str) -> Rule {
    Rule { field, check, msg }
}

/// Body types that declare their own validation rules.
pub trait Validate {
    const RULES: &'static [Rule];
    /// When true, rules only apply to fields present in the body.
    const PARTIAL: bool = false;
}

/// Runs `rules` against `body`, sanitizing it in place.
pub fn validate(body: &mut Map<String, Value>, rules: &[Rule], partial: bool) -> Result<(), Vec<FieldError>> {
    let mut errors: Vec<FieldError> = Vec::new();

    for r in rules {
        if errors.iter().any(|e| e.param == r.field) {
            continue;
        }
        let present = body.get(r.field).map(|v| !v.is_null()).unwrap_or(false);
        if partial && !present {
            continue;
        }
        let value = body.get(r.field).cloned().unwrap_or(Value::Null);
        if let Check::Each(nested) = r.check {
            match validate_each(r.field, value, nested) {
                Ok(Value::Null) => {}
                Ok(sanitized) => {
                    body.insert(r.field.to_string(), sanitized);
                }
                Err(mut nested_errors) => errors.append(&mut nested_errors),
            }
            continue;
        }
        match apply(r.check, &value) {
            Some(sanitized) => {
                if present && sanitized != value {
                    body.insert(r.field.to_string(), sanitized);
                }
            }
            None => errors.push(FieldError::new(r.field, r.msg, value)),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validates every element of a nested array, reporting errors as `field[i].param`.
fn validate_each(field: &str, value: Value, rules: &[Rule]) -> Result<Value, Vec<FieldError>> {
    let items = match value {
        Value::Null => return Ok(Value::Null),
        Value::Array(items) => items,
        other => return Err(vec![FieldError::new(field, "Must be an array", other)]),
    };
    let mut errors = Vec::new();
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let mut obj = match item {
            Value::Object(obj) => obj,
            other => {
                errors.push(FieldError::new(&format!("{}[{}]", field, i), "Must be an object", other));
                continue;
            }
        };
        if let Err(nested) = validate(&mut obj, rules, false) {
            errors.extend(
                nested
                    .into_iter()
                    .map(|e| FieldError::new(&format!("{}[{}].{}", field, i, e.param), &e.msg, e.value)),
            );
        }
        out.push(Value::Object(obj));
    }
    if errors.is_empty() {
        Ok(Value::Array(out))
    } else {
        Err(errors)
    }
}

/// Returns the sanitized value when the check passes.
fn apply(check: Check, value: &Value) -> Option<Value> {
    match check {
        Check::Required => {
            let s = value.as_str()?.trim();
            (!s.is_empty()).then(|| Value::String(s.to_string()))
        }
        Check::MinLength(n) => {
            let s = value.as_str()?.trim();
            (s.chars().count() >= n).then(|| Value::String(s.to_string()))
        }
        Check::Email => {
            let s = value.as_str()?.trim().to_lowercase();
            is_email(&s).then_some(Value::String(s))
        }
        Check::Numeric => as_number(value).map(number_value),
        Check::Positive => as_number(value).filter(|n| *n > 0.0).map(number_value),
        Check::Date => parse_date(value.as_str()?).map(|d| Value::String(d.to_rfc3339())),
        Check::FutureDate => parse_date(value.as_str()?)
            .filter(|d| *d > Utc::now())
            .map(|d| Value::String(d.to_rfc3339())),
        Check::Optional(_) if value.is_null() => Some(Value::Null),
        Check::Optional(inner) => apply(*inner, value),
        // arrays of objects are handled by validate_each
        Check::Each(_) => None,
        Check::Array => value.is_array().then(|| value.clone()),
        Check::NonEmptyArray => value
            .as_array()
            .filter(|a| !a.is_empty())
            .map(|_| value.clone()),
        Check::OneOf(options) => {
            let s = value.as_str()?.trim();
            options.contains(&s).then(|| Value::String(s.to_string()))
        }
        Check::Digits(min, max) => {
            let digits: String = value.as_str()?.chars().filter(|c| !c.is_whitespace()).collect();
            let ok = (min..=max).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit());
            ok.then_some(Value::String(digits))
        }
        Check::Expiry => {
            let s = value.as_str()?.trim();
            let (mm, yy) = s.split_once('/')?;
            let ok = mm.len() == 2
                && yy.len() == 2
                && mm.chars().chain(yy.chars()).all(|c| c.is_ascii_digit())
                && matches!(mm.parse::<u8>(), Ok(1..=12));
            ok.then(|| Value::String(s.to_string()))
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Some(d.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Normalises a path id, rejecting anything that is not a UUID.
pub fn require_id(raw: &str, what: &str) -> Result<String, AppError> {
    uuid::Uuid::parse_str(raw.trim())
        .map(|id| id.to_string())
        .map_err(|_| AppError::bad_request(format!("Invalid {} id", what)))
}

fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.chars().any(char::is_whitespace)
}

/// JSON body extractor that runs `T::RULES` before deserializing into `T`.
pub struct Validated<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Validated<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(body) = Json::<Value>::from_request(req, state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        let Value::Object(mut body) = body else {
            return Err(AppError::bad_request("Request body must be a JSON object"));
        };

        validate(&mut body, T::RULES, T::PARTIAL).map_err(AppError::Validation)?;

        serde_json::from_value(Value::Object(body))
            .map(Validated)
            .map_err(|e| AppError::bad_request(format!("Invalid request body: {}", e)))
    }
}
