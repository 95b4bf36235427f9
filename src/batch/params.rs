//! Typed job parameters, bound once at launch.
//!
//! Raw string maps are parsed against a job's [`ParamDef`] schema; a missing required
//! key or an unparsable value is a [`LaunchError`] and the job never starts. The
//! canonical [`job_key`](JobParameters::job_key) identifies the job instance.

use crate::error::LaunchError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Date format of `Date` parameters
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Declared type of a parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    /// Free text
    String,
    /// Signed integer
    Long,
    /// Calendar date, `YYYY-MM-DD`
    Date,
}

/// One entry of a job's parameter schema
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamDef {
    /// Parameter name, e.g. `startDate`
    pub name: &'static str,
    /// Declared type
    pub kind: ParamKind,
    /// Whether launch fails without it
    pub required: bool,
}

impl ParamDef {
    /// A parameter that must be supplied
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    /// A parameter that may be omitted
    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// A bound parameter value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    /// Free text
    String(String),
    /// Signed integer
    Long(i64),
    /// Calendar date
    Date(NaiveDate),
}

impl ParamValue {
    fn parse(def: &ParamDef, raw: &str) -> Result<Self, LaunchError> {
        let invalid = |reason: String| LaunchError::InvalidParameter {
            name: def.name.to_string(),
            value: raw.to_string(),
            reason,
        };

        match def.kind {
            ParamKind::String => Ok(ParamValue::String(raw.to_string())),
            ParamKind::Long => raw
                .trim()
                .parse::<i64>()
                .map(ParamValue::Long)
                .map_err(|e| invalid(e.to_string())),
            ParamKind::Date => NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
                .map(ParamValue::Date)
                .map_err(|e| invalid(format!("{e}, expected YYYY-MM-DD"))),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::String(s) => f.write_str(s),
            ParamValue::Long(n) => write!(f, "{n}"),
            ParamValue::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
        }
    }
}

/// Immutable parameter set of one job launch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(BTreeMap<String, ParamValue>);

impl JobParameters {
    /// Empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse raw strings against a schema
    ///
    /// Keys not named by the schema are kept as strings and take part in the job key.
    pub fn parse<I, K, V>(raw: I, schema: &[ParamDef]) -> Result<Self, LaunchError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut values = BTreeMap::new();
        for (key, value) in raw {
            let key = key.into();
            let parsed = match schema.iter().find(|def| def.name == key) {
                Some(def) => ParamValue::parse(def, value.as_ref())?,
                None => ParamValue::String(value.as_ref().to_string()),
            };
            values.insert(key, parsed);
        }

        if let Some(missing) = schema
            .iter()
            .find(|def| def.required && !values.contains_key(def.name))
        {
            return Err(LaunchError::MissingParameter(missing.name.to_string()));
        }

        Ok(Self(values))
    }

    /// Add a string parameter
    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), ParamValue::String(value.into()));
        self
    }

    /// Add an integer parameter
    pub fn with_long(mut self, key: impl Into<String>, value: i64) -> Self {
        self.0.insert(key.into(), ParamValue::Long(value));
        self
    }

    /// Add a date parameter
    pub fn with_date(mut self, key: impl Into<String>, value: NaiveDate) -> Self {
        self.0.insert(key.into(), ParamValue::Date(value));
        self
    }

    /// Raw value by key
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    /// String parameter
    pub fn string(&self, key: &str) -> Result<&str, LaunchError> {
        match self.require(key)? {
            ParamValue::String(s) => Ok(s),
            _ => Err(mismatch(key, "string")),
        }
    }

    /// Integer parameter
    pub fn long(&self, key: &str) -> Result<i64, LaunchError> {
        match self.require(key)? {
            ParamValue::Long(n) => Ok(*n),
            _ => Err(mismatch(key, "long")),
        }
    }

    /// Date parameter
    pub fn date(&self, key: &str) -> Result<NaiveDate, LaunchError> {
        match self.require(key)? {
            ParamValue::Date(d) => Ok(*d),
            _ => Err(mismatch(key, "date")),
        }
    }

    /// Canonical `key=value` rendering, sorted by key
    pub fn job_key(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no parameters are bound
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn require(&self, key: &str) -> Result<&ParamValue, LaunchError> {
        self.0
            .get(key)
            .ok_or_else(|| LaunchError::MissingParameter(key.to_string()))
    }
}

fn mismatch(key: &str, expected: &'static str) -> LaunchError {
    LaunchError::TypeMismatch {
        name: key.to_string(),
        expected,
    }
}
