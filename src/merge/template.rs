//! RFC 6570 URI templates over GTFS records.
//!
//! Variables are namespaced by the record they read from: `stops.<column>`,
//! `routes.<column>`, `trips.<column>` and `connection.<field>`. Two
//! pseudo-columns take a date format inside the variable name:
//! `trips.startTime(<format>)` and `connection.departureTime(<format>)` /
//! `connection.arrivalTime(<format>)`. Formats are either chrono `strftime`
//! strings (anything containing `%`) or moment-style tokens (`YYYYMMDDTHHmm`).
//! A bare variable name reads from the template's own scope.
//!
//! Expressions support the level 1-3 operators (`+ # . / ; ? &`) and the `:n`
//! prefix modifier; the explode modifier is accepted and has no effect on
//! string values.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::fmt::Display;
use thiserror::Error;

use crate::schedule::Record;

const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const RESERVED: &AsciiSet = &UNRESERVED
    .remove(b':')
    .remove(b'/')
    .remove(b'?')
    .remove(b'#')
    .remove(b'[')
    .remove(b']')
    .remove(b'@')
    .remove(b'!')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b';')
    .remove(b'=');

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unbalanced braces in template '{0}'")]
    Unbalanced(String),

    #[error("empty expression in template '{0}'")]
    EmptyExpression(String),

    #[error("variable '{variable}' uses scope '{scope}', which the {template} template cannot read")]
    Scope {
        template: &'static str,
        variable: String,
        scope: String,
    },

    #[error("unknown connection field '{0}'")]
    ConnectionField(String),

    #[error("invalid date format '{0}'")]
    DateFormat(String),

    #[error("column '{column}' does not exist in {scope} records")]
    UnknownColumn { scope: &'static str, column: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Stops,
    Routes,
    Trips,
    Connection,
}

impl Scope {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "stops" | "stop" => Some(Scope::Stops),
            "routes" | "route" => Some(Scope::Routes),
            "trips" | "trip" => Some(Scope::Trips),
            "connection" | "connections" => Some(Scope::Connection),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Scope::Stops => "stops",
            Scope::Routes => "routes",
            Scope::Trips => "trips",
            Scope::Connection => "connection",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionField {
    DepartureStop,
    ArrivalStop,
    DepartureTime,
    ArrivalTime,
    DepartureDelay,
    ArrivalDelay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Column(Scope, String),
    TripStart(Option<String>),
    Connection(ConnectionField, Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Variable {
    name: String,
    source: Source,
    prefix: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Simple,
    Reserved,
    Fragment,
    Label,
    Path,
    PathParam,
    Query,
    QueryContinuation,
}

impl Operator {
    fn parse(c: char) -> Option<Self> {
        Some(match c {
            '+' => Operator::Reserved,
            '#' => Operator::Fragment,
            '.' => Operator::Label,
            '/' => Operator::Path,
            ';' => Operator::PathParam,
            '?' => Operator::Query,
            '&' => Operator::QueryContinuation,
            _ => return None,
        })
    }

    fn first(self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved => "",
            Operator::Fragment => "#",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::PathParam => ";",
            Operator::Query => "?",
            Operator::QueryContinuation => "&",
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Operator::Simple | Operator::Reserved | Operator::Fragment => ",",
            Operator::Label => ".",
            Operator::Path => "/",
            Operator::PathParam => ";",
            Operator::Query | Operator::QueryContinuation => "&",
        }
    }

    fn named(self) -> bool {
        matches!(
            self,
            Operator::PathParam | Operator::Query | Operator::QueryContinuation
        )
    }

    fn if_empty(self) -> &'static str {
        match self {
            Operator::Query | Operator::QueryContinuation => "=",
            _ => "",
        }
    }

    fn allowed(self) -> &'static AsciiSet {
        match self {
            Operator::Reserved | Operator::Fragment => RESERVED,
            _ => UNRESERVED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Expression(Operator, Vec<Variable>),
}

/// Which of the four identifiers a template builds. Decides the default scope
/// of bare variables and which scopes may be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Stop,
    Route,
    Trip,
    Connection,
}

impl TemplateKind {
    fn name(self) -> &'static str {
        match self {
            TemplateKind::Stop => "stop",
            TemplateKind::Route => "route",
            TemplateKind::Trip => "trip",
            TemplateKind::Connection => "connection",
        }
    }

    fn default_scope(self) -> Scope {
        match self {
            TemplateKind::Stop => Scope::Stops,
            TemplateKind::Route => Scope::Routes,
            TemplateKind::Trip => Scope::Trips,
            TemplateKind::Connection => Scope::Connection,
        }
    }

    fn can_read(self, scope: Scope) -> bool {
        match self {
            TemplateKind::Stop => scope == Scope::Stops,
            TemplateKind::Route => scope == Scope::Routes,
            TemplateKind::Trip => matches!(scope, Scope::Trips | Scope::Routes),
            TemplateKind::Connection => scope != Scope::Stops,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    raw: String,
    parts: Vec<Part>,
}

/// Values a template may read while expanding. Absent records are treated as
/// having no columns.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub stop: Option<&'a Record>,
    pub route: Option<&'a Record>,
    pub trip: Option<&'a Record>,
    pub trip_start: Option<&'a DateTime<chrono_tz::Tz>>,
    pub connection: Option<&'a ConnectionValues<'a>>,
}

#[derive(Debug, Clone)]
pub struct ConnectionValues<'a> {
    pub departure_stop: &'a str,
    pub arrival_stop: &'a str,
    pub departure_time: DateTime<chrono_tz::Tz>,
    pub arrival_time: DateTime<chrono_tz::Tz>,
    pub departure_delay: i64,
    pub arrival_delay: i64,
}

impl UriTemplate {
    pub fn parse(raw: &str, kind: TemplateKind) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut rest = raw;

        while let Some(open) = rest.find(['{', '}']) {
            if rest.as_bytes()[open] == b'}' {
                return Err(TemplateError::Unbalanced(raw.to_string()));
            }
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| TemplateError::Unbalanced(raw.to_string()))?;
            let body = &after[..close];
            if body.contains('{') {
                return Err(TemplateError::Unbalanced(raw.to_string()));
            }
            parts.push(parse_expression(raw, body, kind)?);
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn expand(&self, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len() + 32);
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expression(op, vars) => {
                    for (i, var) in vars.iter().enumerate() {
                        out.push_str(if i == 0 { op.first() } else { op.separator() });
                        let mut value = resolve(var, ctx)?;
                        if let Some(n) = var.prefix {
                            value = value.chars().take(n).collect();
                        }
                        if op.named() {
                            out.push_str(&var.name);
                            if value.is_empty() {
                                out.push_str(op.if_empty());
                                continue;
                            }
                            out.push('=');
                        }
                        out.extend(utf8_percent_encode(&value, op.allowed()));
                    }
                }
            }
        }
        Ok(out)
    }
}

fn parse_expression(raw: &str, body: &str, kind: TemplateKind) -> Result<Part, TemplateError> {
    let mut chars = body.chars();
    let (op, list) = match chars.next().and_then(Operator::parse) {
        Some(op) => (op, chars.as_str()),
        None => (Operator::Simple, body),
    };
    if list.trim().is_empty() {
        return Err(TemplateError::EmptyExpression(raw.to_string()));
    }

    let vars = split_variables(list)
        .into_iter()
        .map(|varspec| parse_variable(varspec.trim(), kind))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Part::Expression(op, vars))
}

/// Splits on commas outside parentheses so date formats may contain commas.
fn split_variables(list: &str) -> Vec<&str> {
    let mut varspecs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                varspecs.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    varspecs.push(&list[start..]);
    varspecs
}

fn parse_variable(varspec: &str, kind: TemplateKind) -> Result<Variable, TemplateError> {
    let mut varspec = varspec.strip_suffix('*').unwrap_or(varspec);
    let mut prefix = None;
    // A `:n` prefix modifier only ever follows the closing parenthesis of a
    // date format or a plain name.
    if let Some(colon) = varspec.rfind(':') {
        let (head, digits) = (&varspec[..colon], &varspec[colon + 1..]);
        let after_name = !head.contains('(') || head.ends_with(')');
        if after_name && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            prefix = digits.parse().ok();
            varspec = head;
        }
    }

    let (name, format) = match varspec.find('(') {
        Some(open) if varspec.ends_with(')') => {
            (&varspec[..open], Some(varspec[open + 1..varspec.len() - 1].to_string()))
        }
        _ => (varspec, None),
    };
    if let Some(format) = &format {
        validate_format(format)?;
    }

    let (scope, field) = match name.split_once('.') {
        Some((scope_name, field)) => {
            let scope = Scope::parse(scope_name).ok_or_else(|| TemplateError::Scope {
                template: kind.name(),
                variable: varspec.to_string(),
                scope: scope_name.to_string(),
            })?;
            (scope, field)
        }
        None => (kind.default_scope(), name),
    };
    if !kind.can_read(scope) {
        return Err(TemplateError::Scope {
            template: kind.name(),
            variable: varspec.to_string(),
            scope: scope.name().to_string(),
        });
    }

    let source = match (scope, field) {
        (Scope::Trips, "startTime") => Source::TripStart(format),
        (Scope::Connection, field) => {
            let field = match field {
                "departureStop" => ConnectionField::DepartureStop,
                "arrivalStop" => ConnectionField::ArrivalStop,
                "departureTime" => ConnectionField::DepartureTime,
                "arrivalTime" => ConnectionField::ArrivalTime,
                "departureDelay" => ConnectionField::DepartureDelay,
                "arrivalDelay" => ConnectionField::ArrivalDelay,
                other => return Err(TemplateError::ConnectionField(other.to_string())),
            };
            Source::Connection(field, format)
        }
        (scope, column) => Source::Column(scope, column.to_string()),
    };

    Ok(Variable {
        name: field.to_string(),
        source,
        prefix,
    })
}

/// Turns a moment-style date format into a chrono one. Formats that already
/// contain `%` are taken as chrono formats.
fn to_strftime(format: &str) -> String {
    if format.contains('%') {
        return format.to_string();
    }
    const TOKENS: [(&str, &str); 7] = [
        ("YYYY", "%Y"),
        ("YY", "%y"),
        ("MM", "%m"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
    ];
    let mut out = String::with_capacity(format.len() * 2);
    let mut rest = format;
    'outer: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = tail;
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

fn validate_format(format: &str) -> Result<(), TemplateError> {
    let strftime = to_strftime(format);
    if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
        return Err(TemplateError::DateFormat(format.to_string()));
    }
    Ok(())
}

fn format_time<Tz: TimeZone>(time: &DateTime<Tz>, format: Option<&str>) -> String
where
    Tz::Offset: Display,
{
    match format {
        Some(f) => time.format(&to_strftime(f)).to_string(),
        None => time.to_rfc3339(),
    }
}

fn resolve(var: &Variable, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    match &var.source {
        Source::Column(scope, column) => {
            let record = match scope {
                Scope::Stops => ctx.stop,
                Scope::Routes => ctx.route,
                Scope::Trips => ctx.trip,
                Scope::Connection => None,
            };
            record
                .and_then(|r| r.get(column))
                .cloned()
                .ok_or_else(|| TemplateError::UnknownColumn {
                    scope: scope.name(),
                    column: column.clone(),
                })
        }
        Source::TripStart(format) => Ok(ctx
            .trip_start
            .map(|t| format_time(t, format.as_deref()))
            .unwrap_or_default()),
        Source::Connection(field, format) => {
            let Some(c) = ctx.connection else {
                return Ok(String::new());
            };
            Ok(match field {
                ConnectionField::DepartureStop => c.departure_stop.to_string(),
                ConnectionField::ArrivalStop => c.arrival_stop.to_string(),
                ConnectionField::DepartureTime => format_time(&c.departure_time, format.as_deref()),
                ConnectionField::ArrivalTime => format_time(&c.arrival_time, format.as_deref()),
                ConnectionField::DepartureDelay => c.departure_delay.to_string(),
                ConnectionField::ArrivalDelay => c.arrival_delay.to_string(),
            })
        }
    }
}

/// The four identifier templates of a run.
#[derive(Debug, Clone)]
pub struct UriTemplates {
    pub stop: UriTemplate,
    pub route: UriTemplate,
    pub trip: UriTemplate,
    pub connection: UriTemplate,
}

/// On-disk form of [`UriTemplates`].
#[derive(Debug, Deserialize)]
pub struct TemplateDefinitions {
    pub stop: String,
    pub route: String,
    pub trip: String,
    pub connection: String,
}

impl TryFrom<TemplateDefinitions> for UriTemplates {
    type Error = TemplateError;

    fn try_from(defs: TemplateDefinitions) -> Result<Self, TemplateError> {
        Ok(Self {
            stop: UriTemplate::parse(&defs.stop, TemplateKind::Stop)?,
            route: UriTemplate::parse(&defs.route, TemplateKind::Route)?,
            trip: UriTemplate::parse(&defs.trip, TemplateKind::Trip)?,
            connection: UriTemplate::parse(&defs.connection, TemplateKind::Connection)?,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_definitions() -> TemplateDefinitions {
    TemplateDefinitions {
        stop: "http://example.org/stops/{stop_id}".into(),
        route: "http://example.org/routes/{routes.route_short_name}".into(),
        trip: "http://example.org/trips/{trips.trip_id}/{trips.startTime(YYYYMMDD)}".into(),
        connection: "http://example.org/connections/{trips.startTime(YYYYMMDD)}/{connection.departureStop}/{trips.trip_id}".into(),
    }
}
