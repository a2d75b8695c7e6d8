//! Line-to-value transforms applied by `ProcessController::listen`

use std::sync::Arc;

/// What a transform decided for a single output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformStep<T> {
    /// Yield this value to the listener
    Emit(T),
    /// Drop the line and keep going
    Skip,
    /// End the sequence without yielding anything for this line
    Stop,
}

impl<T> From<Option<T>> for TransformStep<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => TransformStep::Emit(v),
            None => TransformStep::Skip,
        }
    }
}

/// Shared transform function. Receives one decoded line without its line terminator.
pub type Transform<T> = Arc<dyn Fn(&str) -> anyhow::Result<TransformStep<T>> + Send + Sync>;

/// Transform that yields every line as-is
pub fn passthrough() -> Transform<String> {
    Arc::new(|line: &str| Ok(TransformStep::Emit(line.to_string())))
}

/// Decode a raw stdout chunk into the text handed to a transform
pub(crate) fn decode_chunk(chunk: &[u8]) -> String {
    String::from_utf8_lossy(chunk)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}
