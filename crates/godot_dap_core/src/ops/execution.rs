use std::time::Duration;

use crate::session::{Session, StopOutcome};
use crate::types::{to_arguments, ContinueBody, ThreadArguments};
use crate::Result;

// Resume commands return as soon as the peer accepts them. Whether the game
// is actually running again is up to the `continued`/`stopped` events.

pub async fn continue_execution(session: &Session, thread_id: i64) -> Result<ContinueBody> {
    let arguments = to_arguments(&ThreadArguments { thread_id })?;
    session.resume("continue", arguments).await?.body_as()
}

pub async fn next(session: &Session, thread_id: i64) -> Result<()> {
    let arguments = to_arguments(&ThreadArguments { thread_id })?;
    session.resume("next", arguments).await.map(|_| ())
}

pub async fn step_in(session: &Session, thread_id: i64) -> Result<()> {
    let arguments = to_arguments(&ThreadArguments { thread_id })?;
    session.resume("stepIn", arguments).await.map(|_| ())
}

pub async fn step_out(session: &Session, thread_id: i64) -> Result<()> {
    let arguments = to_arguments(&ThreadArguments { thread_id })?;
    session.resume("stepOut", arguments).await.map(|_| ())
}

/// Asks the game to pause. The session only reports paused once the
/// `stopped` event arrives.
pub async fn pause(session: &Session, thread_id: i64) -> Result<()> {
    let arguments = to_arguments(&ThreadArguments { thread_id })?;
    session.request_launched("pause", arguments).await.map(|_| ())
}

pub async fn wait_for_stop(session: &Session, timeout: Duration) -> Result<StopOutcome> {
    session.wait_for_stop(timeout).await
}
