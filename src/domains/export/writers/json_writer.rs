use crate::domains::export::types::{BatchFraming, Row};
use crate::domains::export::writer::TextEncoder;
use crate::errors::PipelineResult;

/// Encodes batches as fragments of a single JSON array.
///
/// Concatenating the fragments of every batch in order yields one valid
/// document: the first batch opens `[`, later batches start with `,\n`
/// and the last batch closes `]`.
#[derive(Debug, Clone, Default)]
pub struct JsonEncoder;

impl JsonEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl TextEncoder for JsonEncoder {
    fn encode(&mut self, rows: &[Row], framing: BatchFraming) -> PipelineResult<Vec<u8>> {
        let mut out = Vec::new();
        if framing.first {
            out.push(b'[');
        } else if !rows.is_empty() {
            out.extend_from_slice(b",\n");
        }
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            serde_json::to_writer(&mut out, row)?;
        }
        if framing.last {
            out.push(b']');
        }
        Ok(out)
    }
}
