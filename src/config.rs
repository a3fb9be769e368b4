use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::merge::UriTemplates;
use crate::merge::template::TemplateDefinitions;

/// Loads the identifier templates from a JSON file at `path`.
///
/// ```json
/// {
///   "stop": "http://example.org/stops/{stop_id}",
///   "route": "http://example.org/routes/{routes.route_id}",
///   "trip": "http://example.org/trips/{trips.trip_id}/{trips.startTime(YYYYMMDD)}",
///   "connection": "http://example.org/connections/{trips.startTime(YYYYMMDD)}/{connection.departureStop}/{trips.trip_id}"
/// }
/// ```
pub fn load_templates(path: &Path) -> Result<UriTemplates> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read templates from {}", path.display()))?;
    parse_templates(&content)
}

pub fn parse_templates(content: &str) -> Result<UriTemplates> {
    let defs: TemplateDefinitions =
        serde_json::from_str(content).context("templates must be a JSON object with stop, route, trip and connection")?;
    Ok(UriTemplates::try_from(defs)?)
}

/// Parses the `--headers` argument: a flat JSON object of header names to values.
pub fn parse_headers(json: &str) -> Result<BTreeMap<String, String>> {
    serde_json::from_str(json).context("headers must be a JSON object of strings")
}
