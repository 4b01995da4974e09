// API models and data fetching for ESHOT (İzmir Metropolitan Municipality bus network)
// ESHOT Official website: https://www.eshot.gov.tr/
//
// İzmir Open Data API Endpoints:
// - Live bus positions by line: https://openapi.izmir.bel.tr/api/iztek/hatotobuskonumlari/{line}
//
// The positions endpoint is unauthenticated and takes the line number as a
// path segment. Coordinates come back as strings with a comma decimal
// separator ("38,41") and have to be converted before use.

use chrono::{TimeZone, Utc};
use chrono_tz::Europe::Istanbul;
use reqwest::blocking;
use serde::{Deserialize, Serialize};

// ============================================================================
// Data Structures
// ============================================================================

/// Travel direction of a bus on its line. The feed encodes this as an
/// integer: 1 = outbound (gidiş), everything else = inbound (dönüş).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Direction::Outbound => "Outbound (Gidiş)",
            Direction::Inbound => "Inbound (Dönüş)",
        }
    }
}

/// View-level selector restricting displayed buses by travel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionFilter {
    #[default]
    All,
    Outbound,
    Inbound,
}

impl DirectionFilter {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(DirectionFilter::All),
            "outbound" => Some(DirectionFilter::Outbound),
            "inbound" => Some(DirectionFilter::Inbound),
            _ => None,
        }
    }

    pub fn matches(&self, direction: Direction) -> bool {
        match self {
            DirectionFilter::All => true,
            DirectionFilter::Outbound => direction == Direction::Outbound,
            DirectionFilter::Inbound => direction == Direction::Inbound,
        }
    }
}

/// One reported real-time bus position on the tracked line.
///
/// The feed carries no stable vehicle id, so list position is the only
/// handle a bus has within a single fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusPosition {
    pub direction: Direction,
    /// Parsed from the feed's comma-decimal "KoorX" string. NaN when the
    /// string does not parse; serde_json turns that into null on the wire.
    pub latitude: f64,
    /// Parsed from "KoorY", same rules as latitude.
    pub longitude: f64,
}

// ============================================================================
// Upstream Response Shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct LinePositionsResponse {
    #[serde(rename = "HataVarMi")]
    hata_var_mi: bool,
    // Missing array is treated as an empty line, not a malformed payload.
    #[serde(rename = "HatOtobusKonumlari", default)]
    hat_otobus_konumlari: Vec<RawBusPosition>,
}

#[derive(Debug, Deserialize)]
struct RawBusPosition {
    #[serde(rename = "Yon")]
    yon: i64,
    #[serde(rename = "KoorX", default)]
    koor_x: String,
    #[serde(rename = "KoorY", default)]
    koor_y: String,
}

impl RawBusPosition {
    fn into_position(self) -> BusPosition {
        BusPosition {
            direction: Direction::from_code(self.yon),
            latitude: parse_coordinate(&self.koor_x),
            longitude: parse_coordinate(&self.koor_y),
        }
    }
}

/// Convert a comma-decimal coordinate string ("38,41") to a float. Only the
/// first comma is rewritten; a string that already uses a decimal point
/// parses as-is. Anything unparseable becomes NaN.
pub fn parse_coordinate(raw: &str) -> f64 {
    raw.trim().replacen(',', ".", 1).parse().unwrap_or(f64::NAN)
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EshotError {
    /// The request never completed or the response was unreadable.
    TransportError(String),
    /// The API answered but set its own failure flag.
    UpstreamError,
    /// A refresh was requested before any line number was entered.
    MissingLineNumber,
}

impl EshotError {
    /// Fixed message shown in the UI error banner.
    pub fn user_message(&self) -> &'static str {
        match self {
            EshotError::TransportError(_) => "Something went wrong while calling the ESHOT API.",
            EshotError::UpstreamError => "The ESHOT API reported an error for this line.",
            EshotError::MissingLineNumber => "Please enter a line number.",
        }
    }
}

impl std::fmt::Display for EshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EshotError::TransportError(e) => write!(f, "Transport error: {}", e),
            EshotError::UpstreamError => write!(f, "Upstream error: the API signaled a failure"),
            EshotError::MissingLineNumber => write!(f, "No line number set"),
        }
    }
}

impl std::error::Error for EshotError {}

pub type Result<T> = std::result::Result<T, EshotError>;

// ============================================================================
// Tracker State
// ============================================================================

/// In-memory state of the single tracked line.
///
/// Error state and bus list are mutually exclusive: a successful refresh
/// clears any prior error, a failed fetch clears the bus list. The one
/// exception is a refresh attempted with no line number, which leaves
/// previously fetched buses on screen.
#[derive(Debug, Clone, Default)]
pub struct TrackerState {
    pub line_number: String,
    pub buses: Vec<BusPosition>,
    pub error: Option<EshotError>,
    pub filter: DirectionFilter,
    /// Unix timestamp of the last applied fetch outcome, 0 before any fetch.
    pub last_refresh: i64,
}

impl TrackerState {
    pub fn has_line_number(&self) -> bool {
        !self.line_number.trim().is_empty()
    }

    /// Switch to a new line. A changed line number starts a wholly fresh
    /// cycle: previously fetched buses and errors do not carry over.
    pub fn set_line_number(&mut self, line_number: String) {
        if line_number == self.line_number {
            return;
        }
        self.line_number = line_number;
        self.buses.clear();
        self.error = None;
        self.last_refresh = 0;
    }

    pub fn set_direction_filter(&mut self, filter: DirectionFilter) {
        self.filter = filter;
    }

    /// Fold one fetch outcome into the state. Outcomes are applied in
    /// completion order; when refreshes overlap, the last one applied wins.
    pub fn apply_outcome(&mut self, outcome: Result<Vec<BusPosition>>) {
        match outcome {
            Ok(buses) => {
                self.buses = buses;
                self.error = None;
                self.last_refresh = EshotApi::current_timestamp();
            }
            Err(EshotError::MissingLineNumber) => {
                self.error = Some(EshotError::MissingLineNumber);
            }
            Err(e) => {
                self.buses.clear();
                self.error = Some(e);
                self.last_refresh = EshotApi::current_timestamp();
            }
        }
    }

    /// Buses visible under the current direction filter, preserving the
    /// order the feed reported them in. Recomputed on every call.
    pub fn visible_buses(&self) -> Vec<BusPosition> {
        self.buses
            .iter()
            .filter(|bus| self.filter.matches(bus.direction))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            line_number: self.line_number.clone(),
            filter: self.filter,
            buses: self.visible_buses(),
            total_buses: self.buses.len(),
            error: self.error.as_ref().map(|e| e.user_message().to_string()),
            last_refresh: self.last_refresh,
        }
    }
}

/// What the frontend renders. The bus list is already narrowed to the
/// current direction filter; `total_buses` counts the unfiltered list.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub line_number: String,
    pub filter: DirectionFilter,
    pub buses: Vec<BusPosition>,
    pub total_buses: usize,
    pub error: Option<String>,
    pub last_refresh: i64,
}

// ============================================================================
// Main Implementation
// ============================================================================

pub struct EshotApi;

impl EshotApi {
    const BASE_URL: &'static str = "https://openapi.izmir.bel.tr/api/iztek";
    const REQUEST_TIMEOUT_SECS: u64 = 30;
    /// How often the background task re-polls the tracked line.
    pub const REFRESH_INTERVAL_SECS: u64 = 5;

    /// Fetch current bus positions for one line. No authentication, no
    /// query parameters; the line number is a path segment.
    pub fn fetch_line_positions(line_number: &str) -> Result<Vec<BusPosition>> {
        let url = format!("{}/hatotobuskonumlari/{}", Self::BASE_URL, line_number);

        let client = blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EshotError::TransportError(format!("Failed to create HTTP client: {}", e)))?;

        let response = client.get(&url)
            .send()
            .map_err(|e| EshotError::TransportError(format!("Failed to fetch bus positions: {}", e)))?;

        if !response.status().is_success() {
            return Err(EshotError::TransportError(format!("API returned error: {}", response.status())));
        }

        let body = response.text()
            .map_err(|e| EshotError::TransportError(format!("Failed to read response: {}", e)))?;

        Self::decode_line_positions(&body)
    }

    /// Classify a raw response body: an unreadable payload is a transport
    /// failure, a set failure flag is an upstream failure, anything else is
    /// a (possibly empty) bus list.
    fn decode_line_positions(body: &str) -> Result<Vec<BusPosition>> {
        let parsed: LinePositionsResponse = serde_json::from_str(body)
            .map_err(|e| EshotError::TransportError(format!("Invalid JSON response: {}", e)))?;

        if parsed.hata_var_mi {
            return Err(EshotError::UpstreamError);
        }

        Ok(parsed
            .hat_otobus_konumlari
            .into_iter()
            .map(RawBusPosition::into_position)
            .collect())
    }

    pub fn current_timestamp() -> i64 {
        Utc::now().timestamp()
    }

    pub fn format_timestamp_full(timestamp: i64) -> String {
        match Utc.timestamp_opt(timestamp, 0).single() {
            Some(dt) => {
                let izmir_time = dt.with_timezone(&Istanbul);
                izmir_time.format("%Y-%m-%d %H:%M:%S").to_string()
            }
            None => format!("Invalid timestamp: {}", timestamp),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
