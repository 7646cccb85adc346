use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use hf2_debug::compiler::ArtifactCompiler;
use hf2_debug::image::ImageFormat;
use hf2_debug::link::hf2::{Hf2Link, Hf2Options};
use hf2_debug::link::{HardwareLink, LazyLink, LinkError};
use hf2_debug::{BreakpointMessage, DebugSessionController, DebuggerCommand, HaltStrategy};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;

/// Selects a device by `VID:PID` or `VID:PID:SERIAL`, with hexadecimal IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelector {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeviceSelectorParseError {
    #[error("The format of the selector is invalid. Please use a string in the form `VID:PID:<Serial>`, where Serial is optional.")]
    Format,
    #[error("Could not parse '{0}' as a hexadecimal USB ID")]
    ParseInt(String),
}

impl FromStr for DeviceSelector {
    type Err = DeviceSelectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split into at most 3 parts: VID, PID, Serial.
        let mut split = s.splitn(3, ':');
        let (Some(vid), Some(pid)) = (split.next(), split.next()) else {
            return Err(DeviceSelectorParseError::Format);
        };
        let parse_id = |id: &str| {
            u16::from_str_radix(id.trim_start_matches("0x"), 16)
                .map_err(|_| DeviceSelectorParseError::ParseInt(id.to_string()))
        };

        Ok(DeviceSelector {
            vendor_id: parse_id(vid)?,
            product_id: parse_id(pid)?,
            serial_number: split
                .next()
                .filter(|serial| !serial.is_empty())
                .map(str::to_string),
        })
    }
}

fn parse_u32(input: &str) -> Result<u32, String> {
    parse_int::parse(input).map_err(|e| format!("invalid address '{input}': {e}"))
}

#[derive(clap::Parser)]
pub struct Cmd {
    /// The debug information written by the compiler
    #[clap(long, value_name = "FILE")]
    debug_info: Option<PathBuf>,

    /// The image to flash
    #[clap(long, value_name = "FILE")]
    binary: Option<PathBuf>,

    /// The image format. Guessed from the file extension if not given.
    #[clap(long)]
    format: Option<ImageFormat>,

    /// Load address of a raw binary image
    #[clap(long, value_parser = parse_u32)]
    base_address: Option<u32>,

    /// Command that builds the artifacts, run before the session starts
    #[clap(long, value_name = "CMD", num_args = 1.., allow_hyphen_values = true)]
    build_command: Option<Vec<String>>,

    /// Poll the device for halts instead of waiting for paused notifications
    #[clap(long)]
    poll: bool,

    /// Use the device with the given VID:PID[:SERIAL]
    #[clap(long)]
    device: Option<DeviceSelector>,
}

impl Cmd {
    /// Applies the command line flags on top of the configuration files.
    fn apply(&self, config: &mut Config) {
        let artifacts = &mut config.artifacts;
        if let Some(debug_info) = &self.debug_info {
            artifacts.debug_info = debug_info.clone();
        }
        if let Some(binary) = &self.binary {
            artifacts.binary = binary.clone();
        }
        if let Some(format) = self.format {
            artifacts.format = Some(format);
        }
        if let Some(base_address) = self.base_address {
            artifacts.base_address = base_address;
        }
        if let Some(build_command) = &self.build_command {
            artifacts.build_command = build_command.clone();
        }

        if self.poll {
            config.session.halt_strategy = HaltStrategy::Poll;
        }

        if let Some(selector) = &self.device {
            config.device.vendor_id = Some(selector.vendor_id);
            config.device.product_id = Some(selector.product_id);
            config.device.serial_number = selector.serial_number.clone();
        }
    }

    pub async fn run(self, mut config: Config) -> anyhow::Result<()> {
        self.apply(&mut config);
        tracing::debug!("Using configuration {:?}", config);

        let device = LazyLink::new();
        let link = connect(&device, config.device.clone()).await?;
        let compiler = ArtifactCompiler::from_artifacts(config.artifacts);
        let mut controller = DebugSessionController::new(link, compiler, config.session);

        let hit = controller
            .start_debug()
            .await
            .context("Failed to start the debug session")?;
        emit(&hit)?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let command = match DebuggerCommand::parse(line) {
                Ok(Some(command)) => command,
                Ok(None) => {
                    tracing::debug!("Ignoring message {}", line);
                    continue;
                }
                Err(error) => {
                    tracing::warn!("Ignoring malformed message {:?}: {}", line, error);
                    continue;
                }
            };

            controller.handle_command(command).await?;

            let hit = tokio::select! {
                hit = controller.wait_for_halt() => hit?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted while waiting for the device to halt");
                    break;
                }
            };
            emit(&hit)?;
        }

        controller.end();
        Ok(())
    }
}

async fn connect(device: &LazyLink, options: Hf2Options) -> anyhow::Result<Arc<dyn HardwareLink>> {
    let link = device
        .get_or_connect(|| async move {
            // Opening enumerates USB devices, which blocks.
            let link = tokio::task::spawn_blocking(move || Hf2Link::open(options))
                .await
                .map_err(anyhow::Error::from)??;
            Ok::<_, LinkError>(Arc::new(link) as Arc<dyn HardwareLink>)
        })
        .await
        .context("Failed to open the HF2 device")?;
    Ok(link)
}

/// Writes a message as one JSON line on stdout.
fn emit(message: &BreakpointMessage) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(message)?);
    Ok(())
}

#[cfg(test)]
mod test {
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::config::Configs;

    #[test_case("239a:0018", 0x239a, 0x0018, None ; "without serial")]
    #[test_case("0x239a:0x0018", 0x239a, 0x0018, None ; "with hex prefix")]
    #[test_case("239a:0018:A1B2:C3", 0x239a, 0x0018, Some("A1B2:C3") ; "serial with colon")]
    #[test_case("239a:0018:", 0x239a, 0x0018, None ; "empty serial")]
    fn parses_device_selector(input: &str, vendor_id: u16, product_id: u16, serial: Option<&str>) {
        assert_eq!(
            input.parse::<DeviceSelector>().unwrap(),
            DeviceSelector {
                vendor_id,
                product_id,
                serial_number: serial.map(str::to_string),
            }
        );
    }

    #[test_case("239a" ; "missing pid")]
    #[test_case("239a:zz" ; "bad pid")]
    fn rejects_bad_selectors(input: &str) {
        assert!(input.parse::<DeviceSelector>().is_err());
    }

    #[test]
    fn flags_override_config() {
        let mut config = Configs::new(std::env::temp_dir().join("hf2dbg-no-config"))
            .extract()
            .unwrap();
        let cmd = Cmd::parse_from([
            "debug",
            "--binary",
            "out/app.bin",
            "--base-address",
            "0x2000",
            "--poll",
            "--device",
            "239a:0018",
        ]);

        cmd.apply(&mut config);

        assert_eq!(config.artifacts.binary, PathBuf::from("out/app.bin"));
        assert_eq!(config.artifacts.base_address, 0x2000);
        assert_eq!(config.session.halt_strategy, HaltStrategy::Poll);
        assert_eq!(config.device.vendor_id, Some(0x239a));
        assert_eq!(config.device.serial_number, None);
        // Untouched keys keep their configured value.
        assert_eq!(
            config.artifacts.debug_info,
            PathBuf::from("built/debug-info.json")
        );
    }
}
