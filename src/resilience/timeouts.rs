//! Timeout enforcement.
//!
//! Every outbound call carries a deadline. On expiry the call counts as a
//! `Timeout` failure; the abandoned future is dropped, not cancelled remotely.

use std::future::Future;
use std::time::Duration;

use tokio::time;

use crate::error::CallFailure;

/// Run `fut` under `deadline`, mapping expiry to a timeout failure.
pub async fn with_timeout<T, Fut>(deadline: Duration, fut: Fut) -> Result<T, CallFailure>
where
    Fut: Future<Output = Result<T, CallFailure>>,
{
    match time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(CallFailure::timeout(deadline)),
    }
}
