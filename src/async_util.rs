use std::future::Future;
use std::time::Duration;

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use async_lock::Mutex;
use futures_lite::FutureExt;
use futures_timer::Delay;

/// Runs `fut` to completion unless `timeout` elapses first. `None` waits forever.
pub async fn with_timeout<T>(fut: impl Future<Output = T>, timeout: Option<Duration>) -> Option<T> {
    let fut = async { Some(fut.await) };
    match timeout {
        Some(dur) => {
            fut.or(async {
                Delay::new(dur).await;
                None
            })
            .await
        }
        None => fut.await,
    }
}

/// Blocks the current thread for `dur`.
pub fn sleep_blocking(dur: Duration) {
    futures_lite::future::block_on(Delay::new(dur));
}

/// Lets concurrent callers share a single run of an operation: the first caller leads and
/// runs it, everyone who joins before it finishes receives the leader's outcome.
pub struct SingleFlight<T: Send + Clone> {
    inner: Mutex<Option<InactiveReceiver<T>>>,
}

/// Role assigned by [`SingleFlight::join`].
pub enum Flight<'a, T: Send + Clone> {
    Leader(FlightLeader<'a, T>),
    Follower(FlightFollower<T>),
}

/// Must publish the outcome with [`FlightLeader::finish`]. Dropping it without finishing
/// releases the followers with `None`.
pub struct FlightLeader<'a, T: Send + Clone> {
    owner: &'a SingleFlight<T>,
    sender: Option<Sender<T>>,
}

pub struct FlightFollower<T: Send + Clone> {
    receiver: Receiver<T>,
}

impl<T: Send + Clone> SingleFlight<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn join(&self) -> Flight<'_, T> {
        let mut guard_inner = self.inner.lock_blocking();
        if let Some(inactive) = guard_inner.as_ref() {
            return Flight::Follower(FlightFollower {
                receiver: inactive.activate_cloned(),
            });
        }
        let (mut sender, receiver) = async_broadcast::broadcast(1);
        sender.set_overflow(true);
        guard_inner.replace(receiver.deactivate());
        Flight::Leader(FlightLeader {
            owner: self,
            sender: Some(sender),
        })
    }
}

impl<T: Send + Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Clone> FlightLeader<'_, T> {
    /// Publishes `value` to every follower that joined so far.
    pub fn finish(mut self, value: T) {
        // unregisters first, so that no follower can join after the broadcast.
        let _ = self.owner.inner.lock_blocking().take();
        if let Some(sender) = self.sender.take() {
            let _ = sender.try_broadcast(value);
        }
    }
}

impl<T: Send + Clone> Drop for FlightLeader<'_, T> {
    fn drop(&mut self) {
        if self.sender.take().is_some() {
            let _ = self.owner.inner.lock_blocking().take();
        }
    }
}

impl<T: Send + Clone> FlightFollower<T> {
    /// Waits for the leader's outcome. Returns `None` if the leader gave up.
    pub fn wait(mut self) -> Option<T> {
        futures_lite::future::block_on(self.receiver.recv()).ok()
    }
}
