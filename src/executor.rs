//! Turns "issue a request, get a callback later" into a blocking call with a deadline.
//!
//! Each outstanding operation is registered under an [`OperationKey`] in a table shared
//! with the dispatch thread. The caller parks on a one-shot channel; the dispatcher looks
//! the key up and completes it. The table is the only synchronization point between the
//! two sides.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_lock::Mutex;
use log::{debug, warn};

use crate::async_util::with_timeout;
use crate::error::{Error, ErrorKind, GattStatus};
use crate::gatt_tree::AttributeKey;
use crate::{ConnHandle, DeviceId, Result};

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
    RequestMtu,
    ReadRssi,
    Scan,
}

/// What an operation acts upon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationTarget {
    Adapter,
    Device(DeviceId),
    Connection(ConnHandle),
    Attribute(ConnHandle, AttributeKey),
}

/// Identity of an outstanding operation. At most one operation per key is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub kind: OperationKind,
    pub target: OperationTarget,
}

impl OperationKey {
    pub fn new(kind: OperationKind, target: OperationTarget) -> Self {
        Self { kind, target }
    }

    pub fn connection(kind: OperationKind, handle: ConnHandle) -> Self {
        Self::new(kind, OperationTarget::Connection(handle))
    }

    pub fn attribute(kind: OperationKind, handle: ConnHandle, attr: AttributeKey) -> Self {
        Self::new(kind, OperationTarget::Attribute(handle, attr))
    }

    fn handle(&self) -> Option<ConnHandle> {
        match self.target {
            OperationTarget::Connection(handle) | OperationTarget::Attribute(handle, _) => {
                Some(handle)
            }
            OperationTarget::Adapter | OperationTarget::Device(_) => None,
        }
    }
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            OperationTarget::Adapter => write!(f, "{:?}", self.kind),
            OperationTarget::Device(dev) => write!(f, "{:?} {dev}", self.kind),
            OperationTarget::Connection(handle) => write!(f, "{:?} {handle}", self.kind),
            OperationTarget::Attribute(handle, AttributeKey::Characteristic(key)) => {
                write!(f, "{:?} {handle}/{}", self.kind, key.characteristic)
            }
            OperationTarget::Attribute(handle, AttributeKey::Descriptor(key)) => write!(
                f,
                "{:?} {handle}/{}/{}",
                self.kind, key.characteristic, key.descriptor
            ),
        }
    }
}

/// Payload of a successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Value(Vec<u8>),
    Mtu(u16),
    Rssi(i16),
    Device(DeviceId, i16),
}

impl Completion {
    pub fn into_value(self) -> Result<Vec<u8>> {
        match self {
            Completion::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_mtu(self) -> Result<u16> {
        match self {
            Completion::Mtu(mtu) => Ok(mtu),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_rssi(self) -> Result<i16> {
        match self {
            Completion::Rssi(rssi) => Ok(rssi),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_device(self) -> Result<(DeviceId, i16)> {
        match self {
            Completion::Device(device, rssi) => Ok((device, rssi)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(completion: Completion) -> Error {
    Error::new(
        ErrorKind::Internal,
        format!("unexpected completion {completion:?}"),
    )
}

type Outcome = Result<Option<Completion>>;

/// Position of a radio event in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventSeq(u64);

/// Counts the events emitted by a radio. Shared by its [`EventSink`](crate::EventSink) and
/// the executor completing operations from those events.
#[derive(Debug, Clone, Default)]
pub struct EventClock {
    next: Arc<AtomicU64>,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stamp the next emitted event will carry.
    pub fn now(&self) -> EventSeq {
        EventSeq(self.next.load(Ordering::SeqCst))
    }

    pub(crate) fn tick(&self) -> EventSeq {
        EventSeq(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// A request to be issued once, plus what to do if its completion never comes.
pub struct Operation<'a> {
    key: OperationKey,
    run: Box<dyn FnOnce() -> Result<()> + 'a>,
    cancel: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Operation<'a> {
    /// `run` issues the native request. It is called after the key is registered, so a
    /// completion delivered while it is still running is not lost.
    pub fn new(key: OperationKey, run: impl FnOnce() -> Result<()> + 'a) -> Self {
        Self {
            key,
            run: Box::new(run),
            cancel: None,
        }
    }

    /// Called after a timeout to release whatever the request acquired.
    pub fn on_cancel(mut self, cancel: impl FnOnce() + 'a) -> Self {
        self.cancel = Some(Box::new(cancel));
        self
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }
}

struct Waiter {
    id: u64,
    // events emitted before the request was issued cannot complete it
    issued: EventSeq,
    sender: async_channel::Sender<Outcome>,
}

/// The table of outstanding operations.
///
/// A completion is matched to the waiter of its key only if its event was emitted after
/// the waiter's request was issued. The completion of a request that already timed out
/// is older than any later request on the same key and is dropped.
#[derive(Default)]
pub struct OperationExecutor {
    pending: Mutex<HashMap<OperationKey, Waiter>>,
    clock: EventClock,
}

impl OperationExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor completed by the events of the sink sharing `clock`.
    pub fn with_clock(clock: EventClock) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn clock(&self) -> &EventClock {
        &self.clock
    }

    /// Runs `op` and waits for its completion. `timeout` covers `run` as well as the wait.
    /// See [`OperationExecutor::execute_nonnull`].
    pub fn execute(&self, op: Operation<'_>, timeout: Option<Duration>) -> Outcome {
        let Operation { key, run, cancel } = op;

        let started = Instant::now();
        let (sender, receiver) = async_channel::bounded(1);
        let id = self.register(&key, sender)?;
        if let Err(e) = run() {
            self.unregister(&key, id);
            return Err(e);
        }

        let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
        match futures_lite::future::block_on(with_timeout(receiver.recv(), remaining)) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => Err(Error::new(
                ErrorKind::NotConnected,
                format!("{key} abandoned, the connection was released"),
            )),
            None => {
                if !self.unregister(&key, id) {
                    // completed right at the deadline
                    if let Ok(outcome) = receiver.try_recv() {
                        return outcome;
                    }
                }
                warn!("{key} timed out");
                if let Some(cancel) = cancel {
                    cancel();
                }
                Err(Error::new(ErrorKind::Timeout, format!("{key} timed out")))
            }
        }
    }

    /// Like [`OperationExecutor::execute`], but the completion must carry a result.
    pub fn execute_nonnull(&self, op: Operation<'_>, timeout: Option<Duration>) -> Result<Completion> {
        let key = op.key().clone();
        self.execute(op, timeout)?.ok_or_else(|| {
            Error::new(
                ErrorKind::Internal,
                format!("{key} completed without a result"),
            )
        })
    }

    /// Completes the waiter of `key` from the event stamped `seq`, carrying a status code.
    /// A non-success status fails the operation with [`ErrorKind::Protocol`].
    pub fn notify_completion(
        &self,
        key: &OperationKey,
        seq: EventSeq,
        status: GattStatus,
        result: Option<Completion>,
    ) {
        if status.is_success() {
            self.complete(key, seq, Ok(result));
        } else {
            self.complete(key, seq, Err(ErrorKind::Protocol(status).into()));
        }
    }

    pub fn notify_success(&self, key: &OperationKey, seq: EventSeq, result: Option<Completion>) {
        self.complete(key, seq, Ok(result));
    }

    pub fn notify_failure(&self, key: &OperationKey, seq: EventSeq, error: Error) {
        self.complete(key, seq, Err(error));
    }

    /// Checks if an operation is currently waiting on `key`.
    pub fn is_pending(&self, key: &OperationKey) -> bool {
        self.pending.lock_blocking().contains_key(key)
    }

    /// Fails every operation waiting on `handle` with `error`.
    pub fn fail_target(&self, handle: ConnHandle, error: Error) {
        let mut pending = self.pending.lock_blocking();
        pending.retain(|key, waiter| {
            if key.handle() != Some(handle) {
                return true;
            }
            debug!("{key} failed: {error}");
            let _ = waiter.sender.try_send(Err(error.clone()));
            false
        });
    }

    fn register(&self, key: &OperationKey, sender: async_channel::Sender<Outcome>) -> Result<u64> {
        static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(0);

        let mut pending = self.pending.lock_blocking();
        if pending.contains_key(key) {
            return Err(Error::new(ErrorKind::AlreadyInProgress, key.to_string()));
        }
        let id = NEXT_OPERATION_ID.fetch_add(1, Ordering::SeqCst);
        let issued = self.clock.now();
        pending.insert(key.clone(), Waiter { id, issued, sender });
        Ok(id)
    }

    /// Removes the waiter `id`. Returns `false` if it was completed meanwhile.
    fn unregister(&self, key: &OperationKey, id: u64) -> bool {
        let mut pending = self.pending.lock_blocking();
        if pending.get(key).is_some_and(|w| w.id == id) {
            pending.remove(key);
            true
        } else {
            false
        }
    }

    fn complete(&self, key: &OperationKey, seq: EventSeq, outcome: Outcome) {
        let mut pending = self.pending.lock_blocking();
        let Some(waiter) = pending.get(key) else {
            debug!("no operation waiting for {key}, completion ignored");
            return;
        };
        if seq < waiter.issued {
            warn!("discarded stale completion of {key}");
            return;
        }
        if let Some(waiter) = pending.remove(key) {
            let _ = waiter.sender.try_send(outcome);
        }
    }
}
