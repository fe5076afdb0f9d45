use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde_json::Value;
use std::collections::HashSet;

use crate::domains::export::types::{BatchFraming, CsvOptions, Row};
use crate::domains::export::writer::TextEncoder;
use crate::errors::PipelineResult;

/// CSV encoder whose column set is fixed by the first non-empty batch.
///
/// Fields are quoted only when they contain the delimiter, the quote
/// character or a line break. Keys first seen after the header is fixed
/// are dropped; keys absent from a row render as empty fields.
#[derive(Debug, Clone)]
pub struct CsvEncoder {
    config: CsvOptions,
    columns: Option<Vec<String>>,
    warned_unknown: bool,
}

impl CsvEncoder {
    pub fn new(config: CsvOptions) -> Self {
        Self {
            config,
            columns: None,
            warned_unknown: false,
        }
    }

    /// Encoder continuing an artifact whose header was already written.
    pub fn with_columns(config: CsvOptions, columns: Vec<String>) -> Self {
        Self {
            config,
            columns: Some(columns),
            warned_unknown: false,
        }
    }

    fn collect_columns(rows: &[Row]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for row in rows {
            for key in row.keys() {
                if seen.insert(key.as_str()) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    fn render(value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        }
    }

    fn check_unknown_keys(&mut self, rows: &[Row], columns: &[String]) {
        if self.warned_unknown {
            return;
        }
        let known: HashSet<&str> = columns.iter().map(String::as_str).collect();
        if let Some(key) = rows.iter().flat_map(|r| r.keys()).find(|k| !known.contains(k.as_str())) {
            log::warn!("Dropping CSV field '{}' not present in the header", key);
            self.warned_unknown = true;
        }
    }
}

impl TextEncoder for CsvEncoder {
    fn encode(&mut self, rows: &[Row], framing: BatchFraming) -> PipelineResult<Vec<u8>> {
        if self.columns.is_none() && !rows.is_empty() {
            self.columns = Some(Self::collect_columns(rows));
        }
        let columns = match self.columns.clone() {
            Some(columns) => columns,
            None => return Ok(Vec::new()),
        };
        self.check_unknown_keys(rows, &columns);

        let mut buffer = Vec::new();
        {
            let mut wtr = WriterBuilder::new()
                .delimiter(self.config.delimiter)
                .quote(self.config.quote_char)
                .quote_style(QuoteStyle::Necessary)
                .terminator(Terminator::Any(b'\n'))
                .from_writer(&mut buffer);

            if framing.first && self.config.include_header {
                wtr.write_record(&columns)?;
            }
            for row in rows {
                let record: Vec<String> = columns
                    .iter()
                    .map(|c| row.get(c).map(Self::render).unwrap_or_default())
                    .collect();
                wtr.write_record(&record)?;
            }
            wtr.flush()?;
        }
        Ok(buffer)
    }

    fn columns(&self) -> Option<Vec<String>> {
        self.columns.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    const FIRST: BatchFraming = BatchFraming { first: true, last: false };
    const LAST: BatchFraming = BatchFraming { first: false, last: true };

    #[test]
    fn test_header_written_once_in_first_seen_order() {
        let mut encoder = CsvEncoder::new(CsvOptions::default());
        let first = encoder
            .encode(&[row(json!({ "id": 1, "text": "hi" })), row(json!({ "id": 2, "lang": "en" }))], FIRST)
            .unwrap();
        let second = encoder.encode(&[row(json!({ "id": 3, "text": "yo" }))], LAST).unwrap();

        assert_eq!(String::from_utf8(first).unwrap(), "id,text,lang\n1,hi,\n2,,en\n");
        assert_eq!(String::from_utf8(second).unwrap(), "3,yo,\n");
        assert_eq!(encoder.columns().unwrap(), vec!["id", "text", "lang"]);
    }

    #[test]
    fn test_quotes_only_when_needed() {
        let mut encoder = CsvEncoder::new(CsvOptions::default());
        let out = encoder
            .encode(
                &[row(json!({ "a": "plain", "b": "x,y", "c": "say \"hi\"", "d": "two\nlines" }))],
                BatchFraming { first: true, last: true },
            )
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "a,b,c,d\nplain,\"x,y\",\"say \"\"hi\"\"\",\"two\nlines\"\n"
        );
    }

    #[test]
    fn test_custom_delimiter_without_header() {
        let options = CsvOptions {
            delimiter: b';',
            quote_char: b'\'',
            include_header: false,
        };
        let mut encoder = CsvEncoder::new(options);
        let out = encoder
            .encode(&[row(json!({ "a": "x;y", "b": true, "c": null }))], BatchFraming { first: true, last: true })
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "'x;y';true;\n");
    }

    #[test]
    fn test_late_keys_are_dropped() {
        let mut encoder = CsvEncoder::with_columns(CsvOptions::default(), vec!["id".into()]);
        let out = encoder.encode(&[row(json!({ "id": 7, "extra": "x" }))], LAST).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "7\n");
    }

    #[test]
    fn test_empty_dataset_encodes_nothing() {
        let mut encoder = CsvEncoder::new(CsvOptions::default());
        let out = encoder.encode(&[], BatchFraming { first: true, last: true }).unwrap();
        assert!(out.is_empty());
    }
}
