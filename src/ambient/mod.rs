//! Ambient lighting driven by the displayed media.

pub mod color;
pub mod lights;

use std::fmt;
use std::sync::Arc;

use tokio::task;
use tracing::{debug, warn};

use crate::models::MediaItem;
use crate::settings::SettingsService;

pub use color::{ImageProbe, MediaProbe};
pub use lights::{GattToolLight, LightActuator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Drops the alpha byte of an `0xAARRGGBB` value.
    pub const fn from_argb(argb: u32) -> Self {
        Self::new((argb >> 16) as u8, (argb >> 8) as u8, argb as u8)
    }

    /// Lowercase `rrggbb`.
    pub fn to_hex(&self) -> String {
        format!("{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.to_hex())
    }
}

/// Computes a media item's ambient color and sends it to every configured light.
pub struct AmbientColorUseCase {
    probe: Arc<dyn MediaProbe>,
    light: Arc<dyn LightActuator>,
    settings: SettingsService,
}

impl AmbientColorUseCase {
    pub fn new(
        probe: Arc<dyn MediaProbe>,
        light: Arc<dyn LightActuator>,
        settings: SettingsService,
    ) -> Self {
        Self {
            probe,
            light,
            settings,
        }
    }

    /// Returns the color, or `None` when the item has none (videos,
    /// placeholders, undecodable files). Lights are only touched on success.
    pub async fn execute(&self, item: &MediaItem) -> Option<Rgb> {
        if item.is_placeholder() {
            return None;
        }

        let probe = Arc::clone(&self.probe);
        let probed = item.clone();
        let color = match task::spawn_blocking(move || probe.average_color(&probed)).await {
            Ok(color) => color?,
            Err(e) => {
                warn!(path = ?item.path, error = %e, "Ambient color task failed");
                return None;
            }
        };

        debug!(path = ?item.path, %color, "Ambient color");
        self.dispatch(color);
        Some(color)
    }

    /// Sends `color` to every configured light.
    pub fn dispatch(&self, color: Rgb) {
        let settings = self.settings.read_settings();
        for address in &settings.bluetooth_lights.mac_addresses {
            self.light.set_color(address, color);
        }
    }

    /// Sends one of the configured ARGB presets.
    pub fn dispatch_preset(&self, index: usize) -> Option<Rgb> {
        let settings = self.settings.read_settings();
        let color = Rgb::from_argb(*settings.bluetooth_lights.color_presets.get(index)?);
        self.dispatch(color);
        Some(color)
    }
}
