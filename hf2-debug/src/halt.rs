//! Halt delivery: a one-shot latch and the two ways of feeding it.
//!
//! A [`HaltLatch`] is armed immediately before the device is started or resumed. Arming
//! hands out a [`HaltWait`] future that completes exactly once, when a halt is observed.
//! Re-arming replaces the pending sender, so an older wait can never complete with a later
//! halt; it resolves to [`Error::Superseded`] instead.
//!
//! Halts are observed either by pushing (the link calls an event handler when the device
//! pauses) or by polling (a task queries the halt status on a fixed interval). Both end
//! in [`HaltLatch::fulfill`] and look identical to the session above.

use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::link::{HardwareLink, LinkError};
use crate::protocol;
use crate::Error;

/// A halt reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltNotice {
    pub pc: u32,
}

impl HaltNotice {
    /// Parses the payload of a paused notification, `[pc, ...]`.
    pub fn from_event_payload(payload: &[u8]) -> Result<Self, LinkError> {
        Ok(Self {
            pc: protocol::word_at(payload, 0)?,
        })
    }
}

type HaltResult = Result<HaltNotice, LinkError>;

struct Armed {
    sender: oneshot::Sender<HaltResult>,
    /// Set once the command that sets the device running has been acknowledged. Until then a
    /// polled "halted" status still describes the previous stop.
    running: bool,
}

/// A one-shot signal, re-armed for every run of the device.
#[derive(Clone, Default)]
pub struct HaltLatch {
    slot: Arc<Mutex<Option<Armed>>>,
}

impl HaltLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the latch, replacing any earlier arming.
    pub fn arm(&self) -> HaltWait {
        let (sender, receiver) = oneshot::channel();
        let previous = self.slot.lock().replace(Armed {
            sender,
            running: false,
        });
        if previous.is_some() {
            tracing::trace!("Re-armed halt latch, dropping the previous wait");
        }

        HaltWait { receiver }
    }

    /// Marks the device as running. Polling only reports halts after this.
    pub fn set_running(&self) {
        if let Some(armed) = self.slot.lock().as_mut() {
            armed.running = true;
        }
    }

    /// Returns `true` while a wait is pending and the device has been set running.
    pub fn is_waiting(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|armed| armed.running && !armed.sender.is_closed())
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Completes the pending wait with a halt. Returns `false` if nothing was armed.
    pub fn fulfill(&self, notice: HaltNotice) -> bool {
        self.complete(Ok(notice))
    }

    /// Completes the pending wait with a transport failure.
    pub fn fail(&self, error: LinkError) -> bool {
        self.complete(Err(error))
    }

    /// Drops the pending wait, if any.
    pub fn disarm(&self) {
        self.slot.lock().take();
    }

    fn complete(&self, result: HaltResult) -> bool {
        let Some(armed) = self.slot.lock().take() else {
            return false;
        };

        armed.sender.send(result).is_ok()
    }
}

impl Debug for HaltLatch {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("HaltLatch")
            .field("armed", &slot.is_some())
            .field("running", &slot.as_ref().is_some_and(|armed| armed.running))
            .finish()
    }
}

/// The future handed out by [`HaltLatch::arm`].
#[derive(Debug)]
pub struct HaltWait {
    receiver: oneshot::Receiver<HaltResult>,
}

impl Future for HaltWait {
    type Output = Result<HaltNotice, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| match result {
            Ok(Ok(notice)) => Ok(notice),
            Ok(Err(error)) => Err(Error::Link(error)),
            Err(_) => Err(Error::Superseded),
        })
    }
}

/// How halts are observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaltStrategy {
    /// Push if the link delivers events, poll otherwise.
    #[default]
    Auto,
    Push,
    Poll,
}

/// A running halt observer. Dropping it stops polling.
#[derive(Debug)]
pub enum HaltObserver {
    Push,
    Poll { task: JoinHandle<()> },
}

impl HaltObserver {
    /// Starts observing halts on `link` and feeding them into `latch`.
    ///
    /// With [`HaltStrategy::Push`] the link's paused handler is replaced, which detaches
    /// any latch a previous session registered.
    pub fn install(
        link: &Arc<dyn HardwareLink>,
        latch: &HaltLatch,
        strategy: HaltStrategy,
        poll_interval: Duration,
    ) -> Result<Self, LinkError> {
        let capabilities = link.capabilities();
        let push = match strategy {
            HaltStrategy::Auto if capabilities.events => true,
            HaltStrategy::Auto if capabilities.status_query => false,
            HaltStrategy::Auto => return Err(LinkError::Unsupported("halt observation")),
            HaltStrategy::Push if !capabilities.events => {
                return Err(LinkError::Unsupported("event subscription"))
            }
            HaltStrategy::Poll if !capabilities.status_query => {
                return Err(LinkError::Unsupported("halt status queries"))
            }
            HaltStrategy::Push => true,
            HaltStrategy::Poll => false,
        };

        if push {
            tracing::debug!("Observing halts through paused notifications");
            let latch = latch.clone();
            link.on_event(
                protocol::EV_DBG_PAUSED,
                Box::new(move |payload: &[u8]| match HaltNotice::from_event_payload(payload) {
                    Ok(notice) => {
                        if !latch.fulfill(notice) {
                            tracing::debug!(
                                "Ignoring paused notification at {:#010x}, nobody is waiting",
                                notice.pc
                            );
                        }
                    }
                    Err(error) => tracing::warn!("Malformed paused notification: {}", error),
                }),
            );
            Ok(Self::Push)
        } else {
            tracing::debug!("Polling for halts every {:?}", poll_interval);
            let task = tokio::spawn(poll_for_halt(link.clone(), latch.clone(), poll_interval));
            Ok(Self::Poll { task })
        }
    }
}

impl Drop for HaltObserver {
    fn drop(&mut self) {
        if let Self::Poll { task } = self {
            task.abort();
        }
    }
}

/// Queries the halt status until the link fails.
///
/// Each query is awaited before the next tick is taken, so queries never overlap.
async fn poll_for_halt(link: Arc<dyn HardwareLink>, latch: HaltLatch, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !latch.is_waiting() {
            continue;
        }

        match link.query_halt().await {
            Ok(Some(pc)) => {
                tracing::trace!("Poll found the device halted at {:#010x}", pc);
                latch.fulfill(HaltNotice { pc });
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!("Halt status query failed: {}", error);
                latch.fail(error);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::BinaryImage;
    use crate::link::fake::{FailOn, FakeLink, Operation};
    use crate::link::{EventHandler, LinkCapabilities};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "current_thread")]
    async fn latch_fulfills_once() {
        let latch = HaltLatch::new();
        let wait = latch.arm();

        assert!(latch.fulfill(HaltNotice { pc: 0x10 }));
        assert!(!latch.fulfill(HaltNotice { pc: 0x20 }));
        assert_eq!(wait.await.unwrap(), HaltNotice { pc: 0x10 });
        assert!(!latch.is_armed());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rearming_supersedes_previous_wait() {
        let latch = HaltLatch::new();
        let old = latch.arm();
        let new = latch.arm();

        latch.fulfill(HaltNotice { pc: 0x30 });

        assert!(matches!(old.await, Err(Error::Superseded)));
        assert_eq!(new.await.unwrap().pc, 0x30);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failure_is_delivered_to_waiter() {
        let latch = HaltLatch::new();
        let wait = latch.arm();

        latch.fail(LinkError::Closed);

        assert!(matches!(wait.await, Err(Error::Link(LinkError::Closed))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn waiting_requires_running_device() {
        let latch = HaltLatch::new();
        let _wait = latch.arm();
        assert!(!latch.is_waiting());

        latch.set_running();
        assert!(latch.is_waiting());
    }

    #[test]
    fn paused_payload_starts_with_pc() {
        let payload = protocol::words_to_bytes(&[0x2050, 0xffff_ffff]);
        assert_eq!(HaltNotice::from_event_payload(&payload).unwrap().pc, 0x2050);
        assert!(HaltNotice::from_event_payload(&[1, 2]).is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn push_observer_fulfills_from_event() {
        let fake = Arc::new(FakeLink::new());
        let link: Arc<dyn HardwareLink> = fake.clone();
        let latch = HaltLatch::new();
        let observer =
            HaltObserver::install(&link, &latch, HaltStrategy::Auto, Duration::from_millis(10))
                .unwrap();
        assert!(matches!(observer, HaltObserver::Push));

        let wait = latch.arm();
        fake.halt_now(0x1234);

        assert_eq!(wait.await.unwrap().pc, 0x1234);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn poll_observer_waits_for_running_device() {
        let fake = Arc::new(FakeLink::polled());
        let link: Arc<dyn HardwareLink> = fake.clone();
        let latch = HaltLatch::new();
        let _observer =
            HaltObserver::install(&link, &latch, HaltStrategy::Auto, Duration::from_millis(200))
                .unwrap();

        // The device is still halted from an earlier stop; that must not count.
        fake.halt_now(0x1000);
        let wait = latch.arm();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!fake.operations().contains(&Operation::QueryHalt));

        fake.halt_now(0x2000);
        latch.set_running();

        assert_eq!(wait.await.unwrap().pc, 0x2000);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn poll_failure_is_fatal_for_waiter() {
        let fake = Arc::new(FakeLink::polled());
        fake.inject_failure(FailOn::QueryHalt);
        let link: Arc<dyn HardwareLink> = fake.clone();
        let latch = HaltLatch::new();
        let _observer =
            HaltObserver::install(&link, &latch, HaltStrategy::Poll, Duration::from_millis(100))
                .unwrap();

        let wait = latch.arm();
        latch.set_running();

        assert!(matches!(wait.await, Err(Error::Link(_))));
    }

    /// A link whose status query takes longer than the poll interval.
    #[derive(Debug, Default)]
    struct SlowLink {
        delay: Duration,
        queries: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HardwareLink for SlowLink {
        fn capabilities(&self) -> LinkCapabilities {
            LinkCapabilities {
                events: false,
                status_query: true,
            }
        }

        async fn talk(&self, _opcode: u32, _payload: &[u8]) -> Result<Vec<u8>, LinkError> {
            Err(LinkError::Unsupported("commands"))
        }

        async fn read_words(&self, _address: u32, _count: u32) -> Result<Vec<u32>, LinkError> {
            Err(LinkError::Unsupported("memory reads"))
        }

        async fn write_words(&self, _address: u32, _words: &[u32]) -> Result<(), LinkError> {
            Err(LinkError::Unsupported("memory writes"))
        }

        fn on_event(&self, _event_code: u32, _handler: EventHandler) {}

        async fn flash(&self, _image: &BinaryImage) -> Result<(), LinkError> {
            Err(LinkError::Unsupported("flashing"))
        }

        async fn query_halt(&self) -> Result<Option<u32>, LinkError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn slow_queries_never_overlap() {
        let interval = Duration::from_millis(100);
        let slow = Arc::new(SlowLink {
            delay: interval * 3,
            ..Default::default()
        });
        let link: Arc<dyn HardwareLink> = slow.clone();
        let latch = HaltLatch::new();
        let _observer = HaltObserver::install(&link, &latch, HaltStrategy::Poll, interval).unwrap();

        let _wait = latch.arm();
        latch.set_running();
        tokio::time::sleep(interval * 20).await;

        assert!(slow.queries.load(Ordering::SeqCst) >= 2);
        assert_eq!(slow.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_strategy_must_be_supported() {
        let link: Arc<dyn HardwareLink> = Arc::new(FakeLink::polled());
        let latch = HaltLatch::new();

        assert!(matches!(
            HaltObserver::install(&link, &latch, HaltStrategy::Push, Duration::from_millis(1)),
            Err(LinkError::Unsupported(_))
        ));
    }
}
