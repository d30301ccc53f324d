use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::Side;
use crate::signals::signal::SignalInput;

/// One row of `date,time,symbol,side,entry,stop_loss,tp1..tp4`.
#[derive(Debug, Deserialize)]
struct SignalRecord {
    date: String,
    time: String,
    symbol: String,
    side: String,
    entry: f64,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    tp1: Option<f64>,
    #[serde(default)]
    tp2: Option<f64>,
    #[serde(default)]
    tp3: Option<f64>,
    #[serde(default)]
    tp4: Option<f64>,
}

/// Parses local `date` + `time` and shifts to UTC by subtracting `utc_offset_minutes`.
pub fn parse_signal_time(date: &str, time: &str, utc_offset_minutes: i64) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    let time = NaiveTime::parse_from_str(time.trim(), "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time.trim(), "%H:%M"))
        .ok()?;
    let local = NaiveDateTime::new(date, time);
    Some((local - Duration::minutes(utc_offset_minutes)).and_utc())
}

fn into_input(rec: SignalRecord, row: usize, utc_offset_minutes: i64) -> Result<SignalInput> {
    let row_err = |reason: String| Error::SignalRow { row, reason };

    let timestamp = parse_signal_time(&rec.date, &rec.time, utc_offset_minutes)
        .ok_or_else(|| row_err(format!("bad date/time '{} {}'", rec.date, rec.time)))?;
    let side: Side = rec.side.parse().map_err(row_err)?;
    if rec.symbol.trim().is_empty() {
        return Err(Error::SignalRow {
            row,
            reason: "empty symbol".into(),
        });
    }

    let take_profits = [rec.tp1, rec.tp2, rec.tp3, rec.tp4]
        .into_iter()
        .flatten()
        .filter(|tp| *tp > 0.0)
        .collect();

    Ok(SignalInput {
        symbol: rec.symbol,
        side,
        entry: rec.entry,
        stop_loss: rec.stop_loss.filter(|s| *s > 0.0),
        take_profits,
        timestamp,
    })
}

/// Reads signals from any CSV reader. Malformed rows are logged and skipped.
pub fn read_signals<R: Read>(reader: R, utc_offset_minutes: i64) -> Result<Vec<SignalInput>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut signals = Vec::new();
    for (i, rec) in rdr.deserialize::<SignalRecord>().enumerate() {
        // Header is line 1.
        let row = i + 2;
        let parsed = rec
            .map_err(|e| Error::SignalRow {
                row,
                reason: e.to_string(),
            })
            .and_then(|rec| into_input(rec, row, utc_offset_minutes));
        match parsed {
            Ok(sig) => signals.push(sig),
            Err(e) => warn!("Skipping signal: {}", e),
        }
    }

    signals.sort_by_key(|s| s.timestamp);
    Ok(signals)
}

pub fn load_signals(path: &Path, utc_offset_minutes: i64) -> Result<Vec<SignalInput>> {
    let file = std::fs::File::open(path)?;
    let signals = read_signals(file, utc_offset_minutes)?;
    info!("Loaded {} signals from {}", signals.len(), path.display());
    Ok(signals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
date,time,symbol,side,entry,stop_loss,tp1,tp2,tp3,tp4
2024-01-15,14:30,IDOLUSDT.P,LONG,0.05,0.048,0.051,0.052,,
2024-01-15,09:05:30,ethusdt,short,2500,,,,,
2024-13-40,10:00,BTCUSDT,long,100,95,,,,
2024-01-15,10:00,BTCUSDT,flat,100,95,,,,
";

    #[test]
    fn parses_rows_and_skips_bad_ones() {
        let signals = read_signals(SAMPLE.as_bytes(), 0).unwrap();
        assert_eq!(signals.len(), 2);

        // Sorted by time: the 09:05:30 short comes first.
        let eth = &signals[0];
        assert_eq!(eth.side, Side::Short);
        assert!(eth.stop_loss.is_none());
        assert!(eth.take_profits.is_empty());
        assert_eq!(eth.timestamp.format("%H:%M:%S").to_string(), "09:05:30");

        let idol = &signals[1];
        assert_eq!(idol.symbol, "IDOLUSDT.P");
        assert_eq!(idol.stop_loss, Some(0.048));
        assert_eq!(idol.take_profits, vec![0.051, 0.052]);
    }

    #[test]
    fn applies_utc_offset() {
        // UTC+3 local 14:30 is 11:30 UTC.
        let signals = read_signals(SAMPLE.as_bytes(), 180).unwrap();
        let idol = signals.iter().find(|s| s.symbol.starts_with("IDOL")).unwrap();
        assert_eq!(idol.timestamp.format("%Y-%m-%d %H:%M").to_string(), "2024-01-15 11:30");

        let t = parse_signal_time("2024-01-01", "01:00", 120).unwrap();
        assert_eq!(t.format("%Y-%m-%d %H:%M").to_string(), "2023-12-31 23:00");
    }

    #[test]
    fn accepts_files_without_tp_columns() {
        let data = "date,time,symbol,side,entry,stop_loss\n2024-02-01,00:00,SOLUSDT,long,100,90\n";
        let signals = read_signals(data.as_bytes(), 0).unwrap();
        assert_eq!(signals.len(), 1);
        assert!(signals[0].take_profits.is_empty());
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let signals = load_signals(file.path(), 0).unwrap();
        assert_eq!(signals.len(), 2);
    }
}
