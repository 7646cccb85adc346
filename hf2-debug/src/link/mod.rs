//! The capability interface to the physical device.
//!
//! A [`HardwareLink`] is the only thing allowed to touch the transport. It serializes its
//! own requests, so at most one command is in flight at a time no matter how many callers
//! share it.

pub mod fake;
pub mod hf2;

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::image::BinaryImage;
use crate::protocol::{self, DebugStatus};

/// Callback invoked with the payload of an asynchronous notification.
pub type EventHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Errors raised by the transport.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Error in the USB HID access")]
    HidApi(#[from] hidapi::HidError),
    #[error("No matching device was found")]
    NotFound,
    #[error("Device reported status {status:#04x} (info {info:#04x}) for command {command:#010x}")]
    CommandFailed { command: u32, status: u8, info: u8 },
    #[error("Timed out waiting for a reply to command {0:#010x}")]
    Timeout(u32),
    #[error("Malformed reply from device: {0}")]
    Malformed(String),
    #[error("The link does not support {0}")]
    Unsupported(&'static str),
    #[error("The link was closed")]
    Closed,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<scroll::Error> for LinkError {
    fn from(error: scroll::Error) -> Self {
        LinkError::Malformed(error.to_string())
    }
}

/// What a link can do beyond plain request/response traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCapabilities {
    /// The link delivers unsolicited notifications through [`HardwareLink::on_event`].
    pub events: bool,
    /// The link answers [`HardwareLink::query_halt`].
    pub status_query: bool,
}

#[async_trait::async_trait]
pub trait HardwareLink: Debug + Send + Sync {
    fn capabilities(&self) -> LinkCapabilities;

    /// Sends one command and waits for its reply.
    async fn talk(&self, opcode: u32, payload: &[u8]) -> Result<Vec<u8>, LinkError>;

    /// Reads `count` words starting at the word-aligned `address`.
    async fn read_words(&self, address: u32, count: u32) -> Result<Vec<u32>, LinkError>;

    /// Writes `words` starting at the word-aligned `address`.
    async fn write_words(&self, address: u32, words: &[u32]) -> Result<(), LinkError>;

    /// Registers the handler for `event_code`, replacing any previous one.
    fn on_event(&self, event_code: u32, handler: EventHandler);

    /// Writes the image and boots the device into it.
    async fn flash(&self, image: &BinaryImage) -> Result<(), LinkError>;

    /// Asks whether the device is halted, returning the PC if it is.
    async fn query_halt(&self) -> Result<Option<u32>, LinkError> {
        Err(LinkError::Unsupported("halt status queries"))
    }
}

/// Debug commands every link speaks on top of [`HardwareLink::talk`].
#[async_trait::async_trait]
pub trait DebugCommands: HardwareLink {
    /// Replaces the armed breakpoint set.
    async fn set_breakpoints(&self, addresses: &[u32]) -> Result<(), LinkError> {
        tracing::debug!("Arming breakpoints {:#x?}", addresses);
        self.talk(
            protocol::DBG_SET_BREAKPOINTS,
            &protocol::words_to_bytes(addresses),
        )
        .await?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), LinkError> {
        self.talk(protocol::DBG_RESUME, &[]).await?;
        Ok(())
    }

    async fn write_debug_status(&self, cell: u32, status: DebugStatus) -> Result<(), LinkError> {
        self.write_words(cell, &[status.as_word()]).await
    }
}

impl<T: HardwareLink + ?Sized> DebugCommands for T {}

/// A link that is connected on first use and then shared for the rest of the process.
#[derive(Debug, Default)]
pub struct LazyLink {
    cell: OnceCell<Arc<dyn HardwareLink>>,
}

impl LazyLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the memoized link, running `connect` only if no link exists yet.
    ///
    /// A failed connection is not memoized; the next call tries again.
    pub async fn get_or_connect<F, Fut>(&self, connect: F) -> Result<Arc<dyn HardwareLink>, LinkError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn HardwareLink>, LinkError>>,
    {
        self.cell.get_or_try_init(connect).await.cloned()
    }

    /// Returns the link if it has been connected.
    pub fn get(&self) -> Option<Arc<dyn HardwareLink>> {
        self.cell.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::fake::{FakeLink, Operation};
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn lazy_link_connects_once() {
        let lazy = LazyLink::new();
        let connects = AtomicUsize::new(0);

        for _ in 0..3 {
            lazy.get_or_connect(|| async {
                connects.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(FakeLink::new()) as Arc<dyn HardwareLink>)
            })
            .await
            .unwrap();
        }

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(lazy.get().is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lazy_link_retries_after_failure() {
        let lazy = LazyLink::new();

        let failed = lazy
            .get_or_connect(|| async { Err(LinkError::NotFound) })
            .await;
        assert!(matches!(failed, Err(LinkError::NotFound)));
        assert!(lazy.get().is_none());

        lazy.get_or_connect(|| async { Ok(Arc::new(FakeLink::new()) as Arc<dyn HardwareLink>) })
            .await
            .unwrap();
        assert!(lazy.get().is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn debug_commands_encode_words() {
        let link = FakeLink::new();

        link.set_breakpoints(&[0x2100, 0x2400]).await.unwrap();
        link.resume().await.unwrap();

        assert_eq!(
            link.operations(),
            vec![
                Operation::Talk {
                    opcode: protocol::DBG_SET_BREAKPOINTS,
                    payload: protocol::words_to_bytes(&[0x2100, 0x2400]),
                },
                Operation::Talk {
                    opcode: protocol::DBG_RESUME,
                    payload: vec![],
                },
            ]
        );
        assert_eq!(link.armed_breakpoints(), vec![0x2100, 0x2400]);
    }
}
