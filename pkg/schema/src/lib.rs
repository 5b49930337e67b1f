use std::fmt;

// ---------------------------------------------------------------------------
// Metric catalogue
// ---------------------------------------------------------------------------

/// Header line every metric accumulation starts with.
pub const ACCUMULATION_HEADER: &str = "ID,Hora,Valor\n";

/// Minimum number of comma-separated fields a payload row needs.
pub const MIN_ROW_FIELDS: usize = 7;

const ID_COLUMN: usize = 0;
const TIMESTAMP_COLUMN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    AirTemperature,
    Humidity,
    WaterTemperature,
    WaveHeight,
    Ph,
}

impl Metric {
    /// Declared transfer order. Sessions send accumulations in this order.
    pub const ALL: [Metric; 5] = [
        Metric::AirTemperature,
        Metric::Humidity,
        Metric::WaterTemperature,
        Metric::WaveHeight,
        Metric::Ph,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AirTemperature => "air_temperature",
            Self::Humidity => "humidity",
            Self::WaterTemperature => "water_temperature",
            Self::WaveHeight => "wave_height",
            Self::Ph => "ph",
        }
    }

    /// Accumulation file name, also used as the name announced on the wire.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::AirTemperature => "temperaturaAr.csv",
            Self::Humidity => "humidade.csv",
            Self::WaterTemperature => "temperaturaAgua.csv",
            Self::WaveHeight => "ondulacao.csv",
            Self::Ph => "ph.csv",
        }
    }

    /// Column holding this metric's value in an ingest payload row.
    pub fn column(self) -> usize {
        match self {
            Self::AirTemperature => 1,
            Self::Humidity => 2,
            Self::WaterTemperature => 3,
            Self::WaveHeight => 4,
            Self::Ph => 5,
        }
    }

    /// Position in [`Metric::ALL`].
    pub fn ordinal(self) -> usize {
        self.column() - 1
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload rows
// ---------------------------------------------------------------------------

/// One well-formed data row of an ingest payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorRow {
    pub id: String,
    pub timestamp: String,
    values: [String; 5],
}

impl SensorRow {
    /// Parses a single data row. Returns `None` for rows with fewer than
    /// [`MIN_ROW_FIELDS`] fields; extra trailing fields are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        let columns: Vec<&str> = line.split(',').map(str::trim).collect();
        if columns.len() < MIN_ROW_FIELDS {
            return None;
        }
        let values = Metric::ALL.map(|metric| columns[metric.column()].to_string());
        Some(Self {
            id: columns[ID_COLUMN].to_string(),
            timestamp: columns[TIMESTAMP_COLUMN].to_string(),
            values,
        })
    }

    pub fn value(&self, metric: Metric) -> &str {
        &self.values[metric.ordinal()]
    }

    pub fn sample(&self, metric: Metric) -> MetricSample {
        MetricSample {
            id: self.id.clone(),
            timestamp: self.timestamp.clone(),
            value: self.value(metric).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedPayload {
    pub rows: Vec<SensorRow>,
    pub skipped_rows: usize,
}

/// Splits a tabular payload into rows. The first line is the header and is
/// never interpreted. Malformed rows are counted, not reported as errors.
pub fn parse_payload(text: &str) -> ParsedPayload {
    let mut parsed = ParsedPayload::default();
    for line in text.lines().skip(1) {
        match SensorRow::parse(line) {
            Some(row) => parsed.rows.push(row),
            None => parsed.skipped_rows += 1,
        }
    }
    parsed
}

// ---------------------------------------------------------------------------
// Accumulation records
// ---------------------------------------------------------------------------

/// `(id, timestamp, value)` tuple stored in a metric accumulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pub id: String,
    pub timestamp: String,
    pub value: String,
}

impl MetricSample {
    pub fn to_csv_line(&self) -> String {
        format!("{},{},{}\n", self.id, self.timestamp, self.value)
    }
}

/// True when an accumulation's contents hold nothing beyond the header.
pub fn is_header_only(contents: &[u8]) -> bool {
    contents.len() <= ACCUMULATION_HEADER.len()
}
