use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::{error::Result, types::RunHandle};

/// Launches one isolated execution of a script.
///
/// Implementations must run the script outside the caller's task (a child
/// process, a dedicated thread, …) so a misbehaving script cannot block the
/// scheduler, and must honour [`RunHandle::terminate`] by killing it.
#[async_trait]
pub trait ExecutionRunner: Send + Sync {
    /// Start `script` with `payload`. The runner kills the execution itself
    /// once `timeout` has elapsed.
    ///
    /// Returns as soon as the execution has started; its outcome arrives on
    /// [`RunHandle::completion`].
    async fn run(
        &self,
        script: &Path,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<RunHandle>;
}
