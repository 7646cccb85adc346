//! A [`HardwareLink`] over the HF2 protocol on USB HID.
//!
//! A background thread owns all reads from the device. It reassembles messages, hands
//! responses to the one request in flight and dispatches notifications to the registered
//! handlers. Requests are serialized by an async lock, so there is never more than one
//! pending reply.

pub mod commands;
pub mod packet;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use self::commands::{
    BinInfo, BinMode, HF2_CMD_BININFO, HF2_CMD_READ_WORDS, HF2_CMD_RESET_INTO_APP,
    HF2_CMD_RESET_INTO_BOOTLOADER, HF2_CMD_WRITE_FLASH_PAGE, HF2_CMD_WRITE_WORDS,
    HF2_USAGE_PAGE, MAX_WORDS_PER_COMMAND,
};
use self::packet::{Assembler, Frame, Reply, REPORT_SIZE};
use super::{EventHandler, HardwareLink, LinkCapabilities, LinkError};
use crate::image::BinaryImage;
use crate::protocol;

/// How long the reader thread blocks in a single read.
const READ_SLICE_MS: i32 = 10;

/// Which device to open and how patient to be with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hf2Options {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
    /// Time allowed for a command to be answered.
    #[serde(with = "crate::duration_ms")]
    pub request_timeout: Duration,
    /// Time allowed for the device to come back after a reset.
    #[serde(with = "crate::duration_ms")]
    pub reconnect_timeout: Duration,
}

impl Default for Hf2Options {
    fn default() -> Self {
        Self {
            vendor_id: None,
            product_id: None,
            serial_number: None,
            request_timeout: Duration::from_secs(2),
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

impl Hf2Options {
    /// Without a VID or PID any device on the HF2 usage page matches.
    fn matches(&self, info: &hidapi::DeviceInfo) -> bool {
        let mut device_match = true;

        if let Some(vid) = self.vendor_id {
            device_match &= info.vendor_id() == vid;
        }
        if let Some(pid) = self.product_id {
            device_match &= info.product_id() == pid;
        }
        if self.vendor_id.is_none() && self.product_id.is_none() {
            device_match &= info.usage_page() == HF2_USAGE_PAGE;
        }
        if let Some(serial) = self.serial_number.as_deref() {
            device_match &= info.serial_number() == Some(serial);
        }

        device_match
    }
}

/// A device found by [`list_devices`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hf2DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub product: Option<String>,
    pub path: String,
}

impl fmt::Display for Hf2DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -- {:04x}:{:04x}:{} ({})",
            self.product.as_deref().unwrap_or("<unknown>"),
            self.vendor_id,
            self.product_id,
            self.serial_number.as_deref().unwrap_or(""),
            self.path
        )
    }
}

/// Lists the HID devices on the HF2 usage page.
pub fn list_devices() -> Result<Vec<Hf2DeviceInfo>, LinkError> {
    let api = HidApi::new()?;
    let devices: Vec<_> = api
        .device_list()
        .filter(|info| info.usage_page() == HF2_USAGE_PAGE)
        .map(|info| Hf2DeviceInfo {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            serial_number: info.serial_number().map(str::to_string),
            product: info.product_string().map(str::to_string),
            path: info.path().to_string_lossy().into_owned(),
        })
        .collect();

    tracing::debug!("Found {} HF2 devices", devices.len());
    Ok(devices)
}

struct PendingRequest {
    tag: u16,
    command: u32,
    reply: oneshot::Sender<Result<Vec<u8>, LinkError>>,
}

/// State shared with the reader thread.
#[derive(Default)]
struct Shared {
    device: Mutex<Option<HidDevice>>,
    pending: Mutex<Option<PendingRequest>>,
    handlers: Mutex<HashMap<u32, EventHandler>>,
    shutdown: AtomicBool,
}

impl Shared {
    fn fail_pending(&self, error: LinkError) {
        if let Some(pending) = self.pending.lock().take() {
            let _ = pending.reply.send(Err(error));
        }
    }

    fn dispatch(&self, message: &[u8]) -> Result<(), LinkError> {
        match packet::decode_reply(message)? {
            Reply::Response {
                tag,
                status,
                status_info,
                payload,
            } => {
                let mut pending = self.pending.lock();
                match pending.take() {
                    Some(request) if request.tag == tag => {
                        let result = if status == 0 {
                            Ok(payload)
                        } else {
                            Err(LinkError::CommandFailed {
                                command: request.command,
                                status,
                                info: status_info,
                            })
                        };
                        let _ = request.reply.send(result);
                    }
                    other => {
                        tracing::debug!("Dropping reply with unexpected tag {:#06x}", tag);
                        *pending = other;
                    }
                }
            }
            Reply::Event { code, payload } => match self.handlers.lock().get(&code) {
                Some(handler) => handler(&payload),
                None => tracing::trace!("No handler for event {:#010x}", code),
            },
        }
        Ok(())
    }
}

fn read_loop(shared: Arc<Shared>) {
    let mut assembler = Assembler::new();
    let mut report = [0u8; REPORT_SIZE];

    while !shared.shutdown.load(Ordering::Acquire) {
        let read = {
            let device = shared.device.lock();
            device
                .as_ref()
                .map(|device| device.read_timeout(&mut report, READ_SLICE_MS))
        };

        let length = match read {
            // Disconnected, typically while the device resets.
            None => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            // Timeout is not indicated by error, but by returning 0 read bytes
            Some(Ok(0)) => continue,
            Some(Ok(length)) => length,
            Some(Err(error)) => {
                tracing::warn!("Reading from the device failed: {}", error);
                shared.device.lock().take();
                shared.fail_pending(LinkError::HidApi(error));
                assembler = Assembler::new();
                continue;
            }
        };

        let frame = match assembler.push(&report[..length]) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(error) => {
                tracing::warn!("Discarding packet: {}", error);
                assembler = Assembler::new();
                continue;
            }
        };

        match frame {
            Frame::Message(message) => {
                if let Err(error) = shared.dispatch(&message) {
                    tracing::warn!("Discarding message: {}", error);
                }
            }
            Frame::Serial { stderr, data } => {
                tracing::trace!(
                    "Discarding {} bytes of serial {}: {:?}",
                    data.len(),
                    if stderr { "stderr" } else { "stdout" },
                    String::from_utf8_lossy(&data)
                );
            }
        }
    }

    tracing::debug!("HF2 reader stopped");
}

/// An HF2 device on USB HID.
pub struct Hf2Link {
    options: Hf2Options,
    shared: Arc<Shared>,
    /// Held for the full duration of a request, or of a whole flash.
    request_lock: tokio::sync::Mutex<()>,
    next_tag: AtomicU16,
    reader: Option<JoinHandle<()>>,
}

impl Hf2Link {
    /// Opens the first device matching `options`.
    pub fn open(options: Hf2Options) -> Result<Self, LinkError> {
        let device = open_device(&options)?;
        if let Ok(Some(product)) = device.get_product_string() {
            tracing::info!("Opened HF2 device {}", product);
        }

        let shared = Arc::new(Shared {
            device: Mutex::new(Some(device)),
            ..Default::default()
        });

        let reader = std::thread::Builder::new()
            .name("hf2-reader".to_string())
            .spawn({
                let shared = shared.clone();
                move || read_loop(shared)
            })?;

        Ok(Self {
            options,
            shared,
            request_lock: tokio::sync::Mutex::new(()),
            next_tag: AtomicU16::new(1),
            reader: Some(reader),
        })
    }

    pub fn options(&self) -> &Hf2Options {
        &self.options
    }

    fn next_tag(&self) -> u16 {
        self.next_tag.fetch_add(1, Ordering::Relaxed) & 0x7fff
    }

    fn send(&self, message: &[u8]) -> Result<(), LinkError> {
        let device = self.shared.device.lock();
        let device = device.as_ref().ok_or(LinkError::Closed)?;
        for report in packet::split_reports(message) {
            device.write(&report)?;
        }
        Ok(())
    }

    /// Sends a command the device does not answer, such as a reset.
    fn send_no_reply(&self, command: u32) -> Result<(), LinkError> {
        tracing::debug!("Sending {:#010x} without waiting for a reply", command);
        self.send(&packet::encode_command(command, self.next_tag(), &[]))
    }

    /// Sends a command and waits for its reply. The caller holds `request_lock`.
    async fn talk_locked(&self, command: u32, payload: &[u8]) -> Result<Vec<u8>, LinkError> {
        let tag = self.next_tag();
        let (sender, receiver) = oneshot::channel();
        *self.shared.pending.lock() = Some(PendingRequest {
            tag,
            command,
            reply: sender,
        });

        tracing::trace!(
            "Sending command {:#010x} (tag {:#06x}, {} bytes)",
            command,
            tag,
            payload.len()
        );
        if let Err(error) = self.send(&packet::encode_command(command, tag, payload)) {
            self.shared.pending.lock().take();
            return Err(error);
        }

        match tokio::time::timeout(self.options.request_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.shared.pending.lock().take();
                Err(LinkError::Timeout(command))
            }
        }
    }

    async fn bin_info(&self) -> Result<BinInfo, LinkError> {
        let info = BinInfo::parse(&self.talk_locked(HF2_CMD_BININFO, &[]).await?)?;
        tracing::debug!("Device info: {:?}", info);
        Ok(info)
    }

    /// Waits for the device to re-enumerate after a reset.
    async fn reconnect(&self) -> Result<(), LinkError> {
        self.shared.device.lock().take();
        self.shared.fail_pending(LinkError::Closed);

        // The bootloader may enumerate under a different PID, the serial number stays.
        let options = match self.options.serial_number {
            Some(_) => Hf2Options {
                vendor_id: None,
                product_id: None,
                ..self.options.clone()
            },
            None => self.options.clone(),
        };

        let reopen = async {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                match open_device(&options) {
                    Ok(device) => return device,
                    Err(error) => tracing::trace!("Device not back yet: {}", error),
                }
            }
        };

        let device = tokio::time::timeout(self.options.reconnect_timeout, reopen)
            .await
            .map_err(|_| LinkError::NotFound)?;
        *self.shared.device.lock() = Some(device);
        tracing::debug!("Reconnected to the device");
        Ok(())
    }
}

fn open_device(options: &Hf2Options) -> Result<HidDevice, LinkError> {
    let api = HidApi::new()?;
    let info = api
        .device_list()
        .find(|info| options.matches(info))
        .ok_or(LinkError::NotFound)?;

    tracing::debug!(
        "Opening {:04x}:{:04x} at {:?}",
        info.vendor_id(),
        info.product_id(),
        info.path()
    );
    Ok(info.open_device(&api)?)
}

impl Drop for Hf2Link {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::warn!("HF2 reader thread panicked");
            }
        }
    }
}

impl fmt::Debug for Hf2Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hf2Link")
            .field("options", &self.options)
            .field("connected", &self.shared.device.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl HardwareLink for Hf2Link {
    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities {
            events: true,
            status_query: false,
        }
    }

    async fn talk(&self, opcode: u32, payload: &[u8]) -> Result<Vec<u8>, LinkError> {
        let _guard = self.request_lock.lock().await;
        self.talk_locked(opcode, payload).await
    }

    async fn read_words(&self, address: u32, count: u32) -> Result<Vec<u32>, LinkError> {
        let _guard = self.request_lock.lock().await;
        let mut words = Vec::with_capacity(count as usize);

        while (words.len() as u32) < count {
            let chunk = (count - words.len() as u32).min(MAX_WORDS_PER_COMMAND);
            let chunk_address = address + 4 * words.len() as u32;
            let reply = self
                .talk_locked(
                    HF2_CMD_READ_WORDS,
                    &protocol::words_to_bytes(&[chunk_address, chunk]),
                )
                .await?;

            let chunk_words = protocol::bytes_to_words(&reply)?;
            if chunk_words.len() != chunk as usize {
                return Err(LinkError::Malformed(format!(
                    "asked for {} words at {:#010x}, got {}",
                    chunk,
                    chunk_address,
                    chunk_words.len()
                )));
            }
            words.extend(chunk_words);
        }

        Ok(words)
    }

    async fn write_words(&self, address: u32, words: &[u32]) -> Result<(), LinkError> {
        let _guard = self.request_lock.lock().await;

        for (position, chunk) in words.chunks(MAX_WORDS_PER_COMMAND as usize).enumerate() {
            let chunk_address = address + 4 * MAX_WORDS_PER_COMMAND * position as u32;
            let mut payload = protocol::words_to_bytes(&[chunk_address, chunk.len() as u32]);
            payload.extend(protocol::words_to_bytes(chunk));
            self.talk_locked(HF2_CMD_WRITE_WORDS, &payload).await?;
        }
        Ok(())
    }

    fn on_event(&self, event_code: u32, handler: EventHandler) {
        self.shared.handlers.lock().insert(event_code, handler);
    }

    async fn flash(&self, image: &BinaryImage) -> Result<(), LinkError> {
        let _guard = self.request_lock.lock().await;

        let mut info = self.bin_info().await?;
        if info.mode != BinMode::Bootloader {
            tracing::info!("Resetting into the bootloader");
            self.send_no_reply(HF2_CMD_RESET_INTO_BOOTLOADER)?;
            self.reconnect().await?;
            info = self.bin_info().await?;
        }

        let pages = image.pages(info.flash_page_size as usize);
        tracing::info!(
            "Writing {} pages of {} bytes",
            pages.len(),
            info.flash_page_size
        );
        for (address, data) in pages {
            let mut payload = address.to_le_bytes().to_vec();
            payload.extend_from_slice(&data);
            self.talk_locked(HF2_CMD_WRITE_FLASH_PAGE, &payload).await?;
        }

        tracing::info!("Flashing done, starting the application");
        self.send_no_reply(HF2_CMD_RESET_INTO_APP)?;
        self.reconnect().await
    }
}
