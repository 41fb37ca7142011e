use std::ops::ControlFlow;
use std::path::Path;

use crate::error::FlarmResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
}

/// Network access the engine needs. Timeouts are enforced by the implementation and
/// surface as `FlarmError::NetworkTimeout`.
pub trait Transport: Send + Sync {
    fn fetch_bytes(&self, url: &str) -> FlarmResult<Vec<u8>>;

    /// Streams `url` into `dest` and returns the number of bytes written. Returning
    /// `Break` from `on_progress` aborts with `FlarmError::Cancelled`.
    fn fetch_with_progress(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(TransferProgress) -> ControlFlow<()>,
    ) -> FlarmResult<u64>;
}

pub trait LinkShortener: Send + Sync {
    /// Never fails; implementations hand back the long URL when shortening is unavailable.
    fn shorten(&self, url: &str) -> String;
}
