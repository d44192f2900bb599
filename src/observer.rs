use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use log::debug;

use crate::async_util::with_timeout;
use crate::error::{Error, ErrorKind};
use crate::gatt_tree::CharacteristicKey;
use crate::Result;

type Listener = Box<dyn FnMut(Vec<u8>) + Send + 'static>;

/// Receives the value changes of one characteristic, pushed by the remote device through
/// notifications or indications.
///
/// Without a listener, values are queued in arrival order until taken with
/// [`ChangeObserver::wait_for_update`]. Once a listener is set, the backlog is flushed to it
/// and later values go straight to the listener.
#[derive(Clone)]
pub struct ChangeObserver {
    inner: Arc<ObserverInner>,
}

pub(crate) struct ObserverInner {
    key: CharacteristicKey,
    sender: async_channel::Sender<Vec<u8>>,
    receiver: async_channel::Receiver<Vec<u8>>,
    listener: Mutex<ListenerSlot>,
}

#[derive(Default)]
struct ListenerSlot {
    listener: Option<Listener>,
    // bumped on every set or clear, so a delivery does not restore a replaced listener
    generation: u64,
}

impl std::fmt::Debug for ChangeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeObserver")
            .field("key", &self.inner.key)
            .field("queued", &self.inner.receiver.len())
            .finish()
    }
}

impl ChangeObserver {
    pub(crate) fn new(key: CharacteristicKey) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self {
            inner: Arc::new(ObserverInner {
                key,
                sender,
                receiver,
                listener: Mutex::new(ListenerSlot::default()),
            }),
        }
    }

    /// The characteristic this observer is bound to.
    pub fn key(&self) -> CharacteristicKey {
        self.inner.key
    }

    /// Takes the oldest undelivered value, waiting up to `timeout` for one to arrive.
    pub fn wait_for_update(&self, timeout: Duration) -> Result<Vec<u8>> {
        let fut = with_timeout(self.inner.receiver.recv(), Some(timeout));
        match futures_lite::future::block_on(fut) {
            Some(Ok(value)) => Ok(value),
            Some(Err(_)) => Err(Error::new(
                ErrorKind::NotConnected,
                "notifications of this characteristic were disabled",
            )),
            None => Err(Error::new(
                ErrorKind::Timeout,
                format!("no update of {} received", self.inner.key.characteristic),
            )),
        }
    }

    /// Takes the oldest undelivered value without waiting.
    pub fn try_next(&self) -> Option<Vec<u8>> {
        self.inner.receiver.try_recv().ok()
    }

    /// Number of queued values.
    pub fn pending(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Flushes the queued values to `listener`, then delivers every later value to it.
    ///
    /// The listener runs on the dispatch thread and may itself set or clear the listener.
    pub fn set_listener(&self, mut listener: impl FnMut(Vec<u8>) + Send + 'static) {
        let mut slot = self.inner.listener.lock_blocking();
        while let Ok(value) = self.inner.receiver.try_recv() {
            listener(value);
        }
        slot.generation += 1;
        slot.listener = Some(Box::new(listener));
    }

    /// Removes the listener; values are queued again.
    pub fn clear_listener(&self) {
        let mut slot = self.inner.listener.lock_blocking();
        slot.generation += 1;
        slot.listener = None;
    }

    /// Checks if the observer was detached from its connection.
    pub fn is_closed(&self) -> bool {
        self.inner.sender.is_closed()
    }

    // Only the dispatch thread delivers, so values reach the listener in arrival order.
    pub(crate) fn deliver(&self, value: Vec<u8>) {
        let (mut listener, generation) = {
            let mut slot = self.inner.listener.lock_blocking();
            let Some(listener) = slot.listener.take() else {
                if self.inner.sender.try_send(value).is_err() {
                    debug!("update of closed observer {:?} dropped", self.inner.key);
                }
                return;
            };
            (listener, slot.generation)
        };

        listener(value);

        let mut slot = self.inner.listener.lock_blocking();
        if slot.generation == generation {
            slot.listener = Some(listener);
        }
    }

    /// Stops accepting values. Values still queued can be taken.
    pub(crate) fn close(&self) {
        self.inner.sender.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::BluetoothUuidExt;
    use uuid::Uuid;

    fn observer() -> ChangeObserver {
        ChangeObserver::new(CharacteristicKey {
            service: Uuid::from_u16(0x180d),
            characteristic: Uuid::from_u16(0x2a37),
        })
    }

    #[test]
    fn queued_values_in_order() {
        let obs = observer();
        obs.deliver(vec![1]);
        obs.deliver(vec![2]);
        assert_eq!(obs.pending(), 2);
        assert_eq!(obs.wait_for_update(Duration::from_millis(10)).unwrap(), vec![1]);
        assert_eq!(obs.try_next(), Some(vec![2]));
        let err = obs.wait_for_update(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn listener_gets_backlog_then_live_values() {
        let obs = observer();
        obs.deliver(vec![1]);
        obs.deliver(vec![2]);
        let (tx, rx) = std::sync::mpsc::channel();
        obs.set_listener(move |v| tx.send(v).unwrap());
        obs.deliver(vec![3]);
        assert_eq!(obs.pending(), 0);
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got, vec![vec![1], vec![2], vec![3]]);

        obs.clear_listener();
        obs.deliver(vec![4]);
        assert_eq!(obs.try_next(), Some(vec![4]));
    }

    #[test]
    fn closed_observer_drains_then_fails() {
        let obs = observer();
        obs.deliver(vec![9]);
        obs.close();
        obs.deliver(vec![10]);
        assert!(obs.is_closed());
        assert_eq!(obs.wait_for_update(Duration::from_millis(10)).unwrap(), vec![9]);
        let err = obs.wait_for_update(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn listener_may_clear_itself() {
        let obs = observer();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = obs.clone();
        obs.set_listener(move |v| {
            tx.send(v).unwrap();
            handle.clear_listener();
        });
        obs.deliver(vec![1]);
        obs.deliver(vec![2]);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![vec![1]]);
        assert_eq!(obs.try_next(), Some(vec![2]));
    }

    #[test]
    fn listener_may_replace_itself() {
        let obs = observer();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = obs.clone();
        obs.set_listener(move |v| {
            let tx = tx.clone();
            tx.send((1, v)).unwrap();
            handle.set_listener(move |v| tx.send((2, v)).unwrap());
        });
        obs.deliver(vec![1]);
        obs.deliver(vec![2]);
        obs.deliver(vec![3]);
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got, vec![(1, vec![1]), (2, vec![2]), (2, vec![3])]);
    }
}
