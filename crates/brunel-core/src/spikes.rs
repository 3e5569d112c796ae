//! Plain-text spike files.
//!
//! One event per line, `sender<TAB>time`, time in ms. This is the layout of
//! NEST's `.gdf` recorder output, so files can be compared against NEST runs
//! directly.

use crate::{CoreError, Result, Time};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// A single recorded spike: (sender node id, time in ms)
pub type SpikeEvent = (usize, Time);

/// Write spike events to `path`, overwriting any existing file.
pub fn write_spikes<P: AsRef<Path>>(path: P, events: &[SpikeEvent]) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut out = BufWriter::new(file);
    for &(sender, time) in events {
        writeln!(out, "{}\t{:.3}", sender, time)?;
    }
    out.flush()?;
    Ok(())
}

/// Read spike events written by [`write_spikes`] (or NEST).
///
/// Blank lines and lines starting with `#` are skipped.
pub fn read_spikes<P: AsRef<Path>>(path: P) -> Result<Vec<SpikeEvent>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        events.push(parse_line(line, idx + 1)?);
    }

    Ok(events)
}

fn parse_line(line: &str, line_no: usize) -> Result<SpikeEvent> {
    let mut fields = line.split_whitespace();
    let (Some(sender), Some(time)) = (fields.next(), fields.next()) else {
        return Err(CoreError::ParseError {
            line: line_no,
            message: format!("expected `sender time`, got `{}`", line),
        });
    };

    let sender = sender.parse::<usize>().map_err(|e| CoreError::ParseError {
        line: line_no,
        message: format!("bad sender `{}`: {}", sender, e),
    })?;
    let time = time.parse::<f64>().map_err(|e| CoreError::ParseError {
        line: line_no,
        message: format!("bad time `{}`: {}", time, e),
    })?;

    Ok((sender, time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exc.spikes");
        let events = vec![(1, 0.5), (17, 2.3), (1, 12.0)];

        write_spikes(&path, &events).unwrap();
        let back = read_spikes(&path).unwrap();

        assert_eq!(back.len(), 3);
        assert_eq!(back[1].0, 17);
        assert!((back[1].1 - 2.3).abs() < 1e-9);
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# sender time").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "3 1.100").unwrap();
        writeln!(file, "4\t1.200").unwrap();

        let events = read_spikes(file.path()).unwrap();
        assert_eq!(events, vec![(3, 1.1), (4, 1.2)]);
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1 0.1").unwrap();
        writeln!(file, "two 0.2").unwrap();

        match read_spikes(file.path()) {
            Err(CoreError::ParseError { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_time_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "5").unwrap();
        assert!(matches!(
            read_spikes(file.path()),
            Err(CoreError::ParseError { line: 1, .. })
        ));
    }
}
