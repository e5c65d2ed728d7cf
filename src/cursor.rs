//! Persisted scan cursor.

use crate::error::{Result, StoreError};
use crate::kv::KvStore;
use crate::types::Sequence;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Key the cursor is stored under.
pub const CURSOR_KEY: &[u8] = b"sequence";

/// The highest feed sequence fully processed, as persisted in the store.
pub struct CursorState {
    store: Arc<dyn KvStore>,
    /// Last value written (or loaded), used to enforce monotonicity.
    last: Mutex<Option<Sequence>>,
}

impl CursorState {
    /// Bind to a store, seeding the monotonicity check from the stored value.
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self> {
        let last = Self::read(store.as_ref())?;
        Ok(Self {
            store,
            last: Mutex::new(last),
        })
    }

    /// Read the persisted cursor. `None` if it was never written.
    pub fn load(&self) -> Result<Option<Sequence>> {
        Self::read(self.store.as_ref())
    }

    /// Persist a new cursor value.
    ///
    /// Rewriting the current value is a no-op. Moving backwards is an
    /// invariant violation and fails with [`StoreError::InvalidSequence`].
    pub fn advance(&self, to: Sequence) -> Result<()> {
        let mut last = self.last.lock();
        if let Some(current) = *last {
            if to < current {
                return Err(StoreError::InvalidSequence(to, current));
            }
            if to == current {
                return Ok(());
            }
        }

        let encoded = serde_json::to_vec(&to)?;
        self.store.put(CURSOR_KEY, &encoded)?;
        *last = Some(to);
        trace!(sequence = to.0, "cursor persisted");
        Ok(())
    }

    fn read(store: &dyn KvStore) -> Result<Option<Sequence>> {
        match store.get(CURSOR_KEY)? {
            Some(bytes) => {
                let seq: Sequence = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::Corruption(format!("unreadable cursor value: {}", e))
                })?;
                Ok(Some(seq))
            }
            None => Ok(None),
        }
    }
}
