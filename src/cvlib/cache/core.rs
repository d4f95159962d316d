use std::time::Duration;

use crate::{
    result::CvResult,
    types::{Resource, ResourceKey},
};

/// Key to resource store shared by all controllers. Implementations do their own locking, callers
/// never lock around them. `get` must not touch the network.
pub trait ResourceCache: Send + Sync {
    fn get(&self, key: &ResourceKey) -> Option<Resource>;
    fn put(&self, resource: Resource);
    fn clear(&self) -> CvResult<()>;
    /// Blocks until writes queued in the background are done or the timeout is reached.
    fn flush(&self, _timeout: Duration) -> CvResult<()> {
        Ok(())
    }
}
