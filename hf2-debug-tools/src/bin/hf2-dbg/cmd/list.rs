use hf2_debug::link::hf2::list_devices;

#[derive(clap::Parser)]
pub struct Cmd {}

impl Cmd {
    pub fn run(self) -> anyhow::Result<()> {
        let devices = list_devices()?;

        if !devices.is_empty() {
            println!("The following HF2 devices were found:");
            for (num, device) in devices.iter().enumerate() {
                println!("[{num}]: {device}");
            }
        } else {
            println!("No HF2 devices were found.");
        }
        Ok(())
    }
}
