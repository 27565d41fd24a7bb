//! Bluetooth light control.

use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, warn};

use super::Rgb;

/// GATT characteristic handle the lights accept color writes on.
const COLOR_HANDLE: &str = "0x0009";

/// Sets the color of one light.
pub trait LightActuator: Send + Sync + 'static {
    fn set_color(&self, address: &str, color: Rgb);
}

/// [`LightActuator`] shelling out to `gatttool`, fire-and-forget.
#[derive(Debug, Clone)]
pub struct GattToolLight {
    program: String,
}

impl GattToolLight {
    pub fn new() -> Self {
        Self::with_program("gatttool")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for one color write, e.g.
    /// `-b AA:BB:CC:DD:EE:FF --char-write-req -a 0x0009 -n 56ff800000f0aa`.
    pub fn command_args(address: &str, color: Rgb) -> Vec<String> {
        vec![
            "-b".to_string(),
            address.to_string(),
            "--char-write-req".to_string(),
            "-a".to_string(),
            COLOR_HANDLE.to_string(),
            "-n".to_string(),
            format!("56{}00f0aa", color.to_hex()),
        ]
    }
}

impl Default for GattToolLight {
    fn default() -> Self {
        Self::new()
    }
}

impl LightActuator for GattToolLight {
    fn set_color(&self, address: &str, color: Rgb) {
        let args = Self::command_args(address, color);
        debug!(address, color = %color.to_hex(), "Setting light color");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match child {
            Ok(mut child) => {
                // Reap in the background so the caller never waits on the radio.
                let reaper = thread::Builder::new()
                    .name("gatttool-reaper".to_string())
                    .spawn(move || {
                        let _ = child.wait();
                    });
                if let Err(e) = reaper {
                    warn!(error = %e, "Failed to spawn gatttool reaper thread");
                }
            }
            Err(e) => {
                warn!(program = %self.program, address, error = %e, "Failed to run light command");
            }
        }
    }
}
