//! API shared state containing actor handles

use crate::actors::processor::ProcessorHandle;

/// Shared state passed to all API handlers
#[derive(Clone, Debug)]
pub struct ApiState {
    /// Handle to the processor for counters
    pub processor: ProcessorHandle,
}

impl ApiState {
    pub fn new(processor: ProcessorHandle) -> Self {
        Self { processor }
    }
}
