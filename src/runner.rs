//! Async driving loop for a [`Session`].
//!
//! The session itself is synchronous. This loop only decides when to call
//! [`Session::tick`]: it sleeps until the session's next wakeup, ticks, hands
//! the session to an observer, and repeats until the shutdown future resolves
//! or the observer breaks.
//!
//! Connect handshakes still block inside `tick`, so run this on a runtime
//! where a short stall is acceptable (the CLI uses a current-thread runtime).

use std::future::Future;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::session::Session;
use crate::transport::Backend;

/// Upper bound on how long the loop sleeps when nothing is scheduled.
const IDLE_WAKEUP: Duration = Duration::from_millis(500);

/// Tick `session` until `shutdown` completes or `observer` returns
/// [`ControlFlow::Break`]. Returns the number of ticks performed.
pub async fn run_until<B, F, O>(session: &mut Session<B>, shutdown: F, mut observer: O) -> u64
where
    B: Backend,
    F: Future<Output = ()>,
    O: FnMut(&mut Session<B>) -> ControlFlow<()>,
{
    tokio::pin!(shutdown);
    let mut ticks = 0u64;
    loop {
        let now = Instant::now();
        session.tick(now);
        ticks += 1;
        if observer(session).is_break() {
            debug!("observer stopped the loop after {} ticks", ticks);
            break;
        }

        let wake = session
            .next_wakeup()
            .map_or(now + IDLE_WAKEUP, |w| w.min(now + IDLE_WAKEUP));
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
        }
    }
    ticks
}
