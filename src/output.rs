//! Serializers that render the connection stream in each supported format.
//!
//! Every writer receives connections one at a time through
//! [`ConnectionWriter::write`] and must be closed with
//! [`ConnectionWriter::finish`], which flushes the underlying sink.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use csv::WriterBuilder;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use tracing::debug;

use crate::merge::{Connection, ConnectionType, PickupType};

pub const LC: &str = "http://semweb.mmlab.be/ns/linkedconnections#";
pub const GTFS: &str = "http://vocab.gtfs.org/terms#";
pub const XSD: &str = "http://www.w3.org/2001/XMLSchema#";
const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// A `@context` object followed by one JSON object per line.
    Jsonld,
    Csv,
    Ntriples,
    Turtle,
    Nquads,
}

pub trait ConnectionWriter: Send {
    fn write(&mut self, connection: &Connection) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Creates the writer for `format` on top of `out`.
pub fn connection_writer<W>(format: OutputFormat, out: W) -> Box<dyn ConnectionWriter>
where
    W: Write + Send + 'static,
{
    debug!(?format, "Creating connection writer");
    match format {
        OutputFormat::Json => Box::new(JsonWriter::new(out, false)),
        OutputFormat::Jsonld => Box::new(JsonWriter::new(out, true)),
        OutputFormat::Csv => Box::new(CsvWriter::new(out)),
        OutputFormat::Ntriples => Box::new(RdfWriter::new(out, RdfSyntax::NTriples)),
        OutputFormat::Turtle => Box::new(RdfWriter::new(out, RdfSyntax::Turtle)),
        OutputFormat::Nquads => Box::new(RdfWriter::new(out, RdfSyntax::NQuads)),
    }
}

fn timestamp(t: &DateTime<FixedOffset>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// The JSON-LD context mapping connection keys onto the Linked Connections
/// and GTFS vocabularies.
pub fn jsonld_context() -> serde_json::Value {
    json!({
        "@context": {
            "xsd": XSD,
            "lc": LC,
            "gtfs": GTFS,
            "Connection": "lc:Connection",
            "CanceledConnection": "lc:CanceledConnection",
            "Regular": "gtfs:Regular",
            "NotAvailable": "gtfs:NotAvailable",
            "departureStop": { "@type": "@id", "@id": "lc:departureStop" },
            "arrivalStop": { "@type": "@id", "@id": "lc:arrivalStop" },
            "departureTime": { "@type": "xsd:dateTime", "@id": "lc:departureTime" },
            "arrivalTime": { "@type": "xsd:dateTime", "@id": "lc:arrivalTime" },
            "departureDelay": { "@type": "xsd:integer", "@id": "lc:departureDelay" },
            "arrivalDelay": { "@type": "xsd:integer", "@id": "lc:arrivalDelay" },
            "direction": { "@type": "xsd:string", "@id": "gtfs:headsign" },
            "gtfs:trip": { "@type": "@id" },
            "gtfs:route": { "@type": "@id" },
            "gtfs:pickupType": { "@type": "@vocab" },
            "gtfs:dropOffType": { "@type": "@vocab" }
        }
    })
}

struct JsonWriter<W: Write> {
    out: W,
    context: bool,
    started: bool,
}

impl<W: Write> JsonWriter<W> {
    fn new(out: W, context: bool) -> Self {
        Self {
            out,
            context,
            started: false,
        }
    }

    fn start(&mut self) -> Result<()> {
        if !self.started {
            if self.context {
                serde_json::to_writer(&mut self.out, &jsonld_context())?;
                self.out.write_all(b"\n")?;
            }
            self.started = true;
        }
        Ok(())
    }
}

impl<W: Write + Send> ConnectionWriter for JsonWriter<W> {
    fn write(&mut self, connection: &Connection) -> Result<()> {
        self.start()?;
        serde_json::to_writer(&mut self.out, connection)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.start()?;
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvRow<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    departure_stop: &'a str,
    arrival_stop: &'a str,
    departure_time: String,
    arrival_time: String,
    departure_delay: i64,
    arrival_delay: i64,
    direction: &'a str,
    trip: &'a str,
    route: &'a str,
    pickup_type: &'static str,
    drop_off_type: &'static str,
}

impl<'a> From<&'a Connection> for CsvRow<'a> {
    fn from(c: &'a Connection) -> Self {
        Self {
            id: &c.id,
            kind: c.kind.as_str(),
            departure_stop: &c.departure_stop,
            arrival_stop: &c.arrival_stop,
            departure_time: timestamp(&c.departure_time),
            arrival_time: timestamp(&c.arrival_time),
            departure_delay: c.departure_delay,
            arrival_delay: c.arrival_delay,
            direction: c.direction.as_deref().unwrap_or_default(),
            trip: &c.trip,
            route: &c.route,
            pickup_type: c.pickup_type.map(PickupType::as_str).unwrap_or_default(),
            drop_off_type: c.drop_off_type.map(PickupType::as_str).unwrap_or_default(),
        }
    }
}

struct CsvWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvWriter<W> {
    fn new(out: W) -> Self {
        Self {
            writer: WriterBuilder::new().has_headers(true).from_writer(out),
        }
    }
}

impl<W: Write + Send> ConnectionWriter for CsvWriter<W> {
    fn write(&mut self, connection: &Connection) -> Result<()> {
        self.writer.serialize(CsvRow::from(connection))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RdfSyntax {
    NTriples,
    Turtle,
    NQuads,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Iri(String),
    /// An IRI inside one of the known vocabularies, as (namespace, local name).
    Vocab(&'static str, &'static str),
    Literal(String, Option<&'static str>),
}

fn prefix_of(namespace: &str) -> &'static str {
    match namespace {
        LC => "lc",
        GTFS => "gtfs",
        XSD => "xsd",
        _ => "rdf",
    }
}

/// Escapes a literal for the N-Triples family of syntaxes.
fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

impl Term {
    fn full(&self) -> String {
        match self {
            Term::Iri(iri) => format!("<{iri}>"),
            Term::Vocab(ns, local) => format!("<{ns}{local}>"),
            Term::Literal(value, None) => format!("\"{}\"", escape_literal(value)),
            Term::Literal(value, Some(datatype)) => {
                format!("\"{}\"^^<{XSD}{datatype}>", escape_literal(value))
            }
        }
    }

    fn prefixed(&self) -> String {
        match self {
            Term::Vocab(ns, local) => format!("{}:{local}", prefix_of(ns)),
            Term::Literal(value, Some(datatype)) => {
                format!("\"{}\"^^xsd:{datatype}", escape_literal(value))
            }
            other => other.full(),
        }
    }
}

fn predicate_object_pairs(c: &Connection) -> Vec<(Term, Term)> {
    let kind = match c.kind {
        ConnectionType::Connection => "Connection",
        ConnectionType::CanceledConnection => "CanceledConnection",
    };
    let mut pairs = vec![
        (Term::Iri(RDF_TYPE.to_string()), Term::Vocab(LC, kind)),
        (
            Term::Vocab(LC, "departureStop"),
            Term::Iri(c.departure_stop.clone()),
        ),
        (
            Term::Vocab(LC, "arrivalStop"),
            Term::Iri(c.arrival_stop.clone()),
        ),
        (
            Term::Vocab(LC, "departureTime"),
            Term::Literal(timestamp(&c.departure_time), Some("dateTime")),
        ),
        (
            Term::Vocab(LC, "arrivalTime"),
            Term::Literal(timestamp(&c.arrival_time), Some("dateTime")),
        ),
        (
            Term::Vocab(LC, "departureDelay"),
            Term::Literal(c.departure_delay.to_string(), Some("integer")),
        ),
        (
            Term::Vocab(LC, "arrivalDelay"),
            Term::Literal(c.arrival_delay.to_string(), Some("integer")),
        ),
    ];
    if let Some(direction) = &c.direction {
        pairs.push((
            Term::Vocab(GTFS, "headsign"),
            Term::Literal(direction.clone(), None),
        ));
    }
    pairs.push((Term::Vocab(GTFS, "trip"), Term::Iri(c.trip.clone())));
    pairs.push((Term::Vocab(GTFS, "route"), Term::Iri(c.route.clone())));
    if let Some(pickup) = c.pickup_type {
        pairs.push((Term::Vocab(GTFS, "pickupType"), Term::Vocab(GTFS, pickup.as_str())));
    }
    if let Some(drop_off) = c.drop_off_type {
        pairs.push((
            Term::Vocab(GTFS, "dropOffType"),
            Term::Vocab(GTFS, drop_off.as_str()),
        ));
    }
    pairs
}

struct RdfWriter<W: Write> {
    out: W,
    syntax: RdfSyntax,
    started: bool,
}

impl<W: Write> RdfWriter<W> {
    fn new(out: W, syntax: RdfSyntax) -> Self {
        Self {
            out,
            syntax,
            started: false,
        }
    }

    fn start(&mut self) -> Result<()> {
        if !self.started {
            if self.syntax == RdfSyntax::Turtle {
                for ns in [LC, GTFS, XSD] {
                    writeln!(self.out, "@prefix {}: <{ns}> .", prefix_of(ns))?;
                }
                writeln!(self.out)?;
            }
            self.started = true;
        }
        Ok(())
    }
}

impl<W: Write + Send> ConnectionWriter for RdfWriter<W> {
    fn write(&mut self, connection: &Connection) -> Result<()> {
        self.start()?;
        let subject = Term::Iri(connection.id.clone()).full();
        let pairs = predicate_object_pairs(connection);

        match self.syntax {
            RdfSyntax::NTriples => {
                for (p, o) in &pairs {
                    writeln!(self.out, "{subject} {} {} .", p.full(), o.full())?;
                }
            }
            RdfSyntax::NQuads => {
                let graph = Term::Iri(connection.trip.clone()).full();
                for (p, o) in &pairs {
                    writeln!(self.out, "{subject} {} {} {graph} .", p.full(), o.full())?;
                }
            }
            RdfSyntax::Turtle => {
                let last = pairs.len().saturating_sub(1);
                writeln!(self.out, "{subject}")?;
                for (i, (p, o)) in pairs.iter().enumerate() {
                    let predicate = match p {
                        Term::Iri(iri) if iri == RDF_TYPE => "a".to_string(),
                        other => other.prefixed(),
                    };
                    let end = if i == last { " ." } else { " ;" };
                    writeln!(self.out, "    {predicate} {}{end}", o.prefixed())?;
                }
                writeln!(self.out)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.start()?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A cloneable in-memory sink so tests can inspect what a boxed writer produced.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn sample(id: &str) -> Connection {
        let t = |s: &str| DateTime::parse_from_rfc3339(s).unwrap();
        Connection {
            id: format!("http://example.org/connections/{id}"),
            kind: ConnectionType::Connection,
            departure_stop: "http://example.org/stops/A".into(),
            arrival_stop: "http://example.org/stops/B".into(),
            departure_time: t("2024-03-04T08:00:00+01:00"),
            arrival_time: t("2024-03-04T08:12:00+01:00"),
            departure_delay: 0,
            arrival_delay: 120,
            direction: Some("Central \"Station\"".into()),
            trip: "http://example.org/trips/T1".into(),
            route: "http://example.org/routes/1".into(),
            pickup_type: Some(PickupType::Regular),
            drop_off_type: None,
        }
    }

    fn render(format: OutputFormat, connections: &[Connection]) -> String {
        let buffer = SharedBuffer::default();
        let mut writer = connection_writer(format, buffer.clone());
        for c in connections {
            writer.write(c).unwrap();
        }
        writer.finish().unwrap();
        buffer.text()
    }

    #[test]
    fn test_json_one_object_per_line() {
        let text = render(OutputFormat::Json, &[sample("1"), sample("2")]);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["@id"], "http://example.org/connections/1");
        assert_eq!(value["@type"], "Connection");
        assert_eq!(value["arrivalDelay"], 120);
        assert_eq!(value["gtfs:pickupType"], "Regular");
        assert!(value.get("gtfs:dropOffType").is_none());
    }

    #[test]
    fn test_jsonld_starts_with_context() {
        let text = render(OutputFormat::Jsonld, &[sample("1")]);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let context: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(context["@context"]["lc"], LC);
        assert!(lines[1].contains("\"@id\""));
    }

    #[test]
    fn test_jsonld_context_written_without_connections() {
        let text = render(OutputFormat::Jsonld, &[]);
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn test_csv_writes_header_once() {
        let text = render(OutputFormat::Csv, &[sample("1"), sample("2")]);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,type,departureStop,arrivalStop,departureTime"));
        assert_eq!(
            lines.iter().filter(|l| l.starts_with("id,")).count(),
            1
        );
        assert!(lines[1].contains("2024-03-04T08:00:00+01:00"));
    }

    #[test]
    fn test_ntriples_lines() {
        let text = render(OutputFormat::Ntriples, &[sample("1")]);
        assert!(text.lines().all(|l| l.ends_with(" .")));
        assert!(text.contains(&format!(
            "<http://example.org/connections/1> <{RDF_TYPE}> <{LC}Connection> ."
        )));
        assert!(text.contains(&format!(
            "<{LC}arrivalDelay> \"120\"^^<{XSD}integer> ."
        )));
        assert!(text.contains(r#""Central \"Station\"""#));
    }

    #[test]
    fn test_nquads_graph_is_trip() {
        let text = render(OutputFormat::Nquads, &[sample("1")]);
        assert!(
            text.lines()
                .all(|l| l.ends_with("<http://example.org/trips/T1> ."))
        );
    }

    #[test]
    fn test_turtle_prefixes_once() {
        let text = render(OutputFormat::Turtle, &[sample("1"), sample("2")]);
        assert_eq!(text.matches("@prefix lc:").count(), 1);
        assert!(text.contains("    a lc:Connection ;"));
        assert!(text.contains("    gtfs:pickupType gtfs:Regular ."));
        assert!(text.contains("\"2024-03-04T08:12:00+01:00\"^^xsd:dateTime"));
    }

    #[test]
    fn test_canceled_connection_type() {
        let mut c = sample("1");
        c.kind = ConnectionType::CanceledConnection;
        let text = render(OutputFormat::Ntriples, &[c]);
        assert!(text.contains(&format!("<{LC}CanceledConnection>")));
    }
}
