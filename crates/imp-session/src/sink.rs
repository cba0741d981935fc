//! Destinations for measurement points

use std::io::Write;

use imp_protocol::MeasurementPoint;

/// Column header written by [`CsvSink`]
pub const CSV_HEADER: &str = "Frequency ID,Real Part,Imaginary Part";

/// Receives measurement points one at a time
pub trait ResultSink {
    fn accept(&mut self, point: &MeasurementPoint) -> std::io::Result<()>;

    /// Flush buffered output once the stream ends
    fn finish(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl ResultSink for Vec<MeasurementPoint> {
    fn accept(&mut self, point: &MeasurementPoint) -> std::io::Result<()> {
        self.push(*point);
        Ok(())
    }
}

/// Writes points as CSV rows
pub struct CsvSink<W: Write> {
    writer: W,
    header_written: bool,
    rows: usize,
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
            rows: 0,
        }
    }

    /// Rows written so far, header excluded
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn write_header(&mut self) -> std::io::Result<()> {
        if !self.header_written {
            writeln!(self.writer, "{}", CSV_HEADER)?;
            self.header_written = true;
        }
        Ok(())
    }

    /// Finish and return the underlying writer
    pub fn into_inner(mut self) -> std::io::Result<W> {
        self.finish()?;
        Ok(self.writer)
    }
}

impl<W: Write> ResultSink for CsvSink<W> {
    fn accept(&mut self, point: &MeasurementPoint) -> std::io::Result<()> {
        self.write_header()?;
        writeln!(
            self.writer,
            "{},{},{}",
            point.frequency_id, point.real, point.imaginary
        )?;
        self.rows += 1;
        Ok(())
    }

    /// An empty run still produces the header
    fn finish(&mut self) -> std::io::Result<()> {
        self.write_header()?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(frequency_id: u16, real: f64, imaginary: f64) -> MeasurementPoint {
        MeasurementPoint {
            frequency_id,
            frequency_hz: 1000.0,
            real,
            imaginary,
            spectrum_index: 0,
        }
    }

    #[test]
    fn test_csv_rows() {
        let mut sink = CsvSink::new(Vec::new());
        sink.accept(&point(0, 1000.0, -1591.5)).unwrap();
        sink.accept(&point(1, 999.5, -20.25)).unwrap();
        assert_eq!(sink.rows(), 2);

        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(
            text,
            "Frequency ID,Real Part,Imaginary Part\n0,1000,-1591.5\n1,999.5,-20.25\n"
        );
    }

    #[test]
    fn test_empty_csv_has_header() {
        let sink = CsvSink::new(Vec::new());
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(text, "Frequency ID,Real Part,Imaginary Part\n");
    }

    #[test]
    fn test_vec_collects() {
        let mut points: Vec<MeasurementPoint> = Vec::new();
        points.accept(&point(3, 1.0, 2.0)).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].frequency_id, 3);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn csv_rows_parse_back(
                rows in proptest::collection::vec((any::<u16>(), -1e6f64..1e6, -1e6f64..1e6), 0..50)
            ) {
                let mut sink = CsvSink::new(Vec::new());
                for (id, real, imaginary) in &rows {
                    sink.accept(&point(*id, *real, *imaginary)).unwrap();
                }
                let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
                let lines: Vec<&str> = text.lines().collect();

                prop_assert_eq!(lines.len(), rows.len() + 1);
                prop_assert_eq!(lines[0], CSV_HEADER);
                for (line, (id, real, imaginary)) in lines[1..].iter().zip(&rows) {
                    let fields: Vec<&str> = line.split(',').collect();
                    prop_assert_eq!(fields.len(), 3);
                    prop_assert_eq!(fields[0].parse::<u16>().unwrap(), *id);
                    prop_assert_eq!(fields[1].parse::<f64>().unwrap(), *real);
                    prop_assert_eq!(fields[2].parse::<f64>().unwrap(), *imaginary);
                }
            }
        }
    }
}
