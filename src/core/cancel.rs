//! Purpose: Cooperative cancellation for a single query execution.
//! Exports: `CancelFlag`.
//! Role: Checked by the scan loop at each record-batch boundary.
//! Invariants: Once raised, a flag stays raised; checks never block.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    raised: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.raised.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::new(ErrorKind::Cancelled).with_message("query cancelled"));
        }
        Ok(())
    }
}
