//! Track point input: a JSON array of points, or one JSON object per line.
//!
//! Line input is forgiving. Blank lines and `#` comments are ignored and a
//! line that fails to parse is logged and skipped.

use std::io::{self, BufRead};
use std::path::Path;

use tracing::warn;

use skylog_core::types::*;

/// Parse one line of JSON-lines input. `None` for blank and comment lines.
pub fn parse_line(line: &str) -> Option<Result<TrackPoint>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line).map_err(SkylogError::from))
}

/// Parse a whole tracklog. An array must parse completely; JSON lines skip
/// bad lines.
pub fn parse_points(text: &str) -> Result<Vec<TrackPoint>> {
    if text.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(text)?);
    }

    let mut points = Vec::new();
    for (i, line) in text.lines().enumerate() {
        match parse_line(line) {
            Some(Ok(p)) => points.push(p),
            Some(Err(e)) => warn!(line = i + 1, "skipping unparseable point: {e}"),
            None => {}
        }
    }
    Ok(points)
}

/// Read a tracklog from `path`, or stdin when the path is `-`.
pub fn load_points(path: &Path) -> Result<Vec<TrackPoint>> {
    let text = if path.to_str() == Some("-") {
        let mut text = String::new();
        for line in io::stdin().lock().lines() {
            text.push_str(&line?);
            text.push('\n');
        }
        text
    } else {
        std::fs::read_to_string(path)?
    };
    parse_points(&text)
}
