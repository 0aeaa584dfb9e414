//! Audio routing selection

use std::fmt;

/// Where voice audio is captured from and played to.
///
/// Variants are declared in ascending priority; [`select_route`] picks the
/// highest one available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceRoute {
    BuiltinSpeaker,
    BuiltinEarpiece,
    WiredHeadset,
    BluetoothSco,
}

impl DeviceRoute {
    /// Guess a route from a device name reported by the platform
    pub fn classify(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if ["bluetooth", "bluez", "sco", "hfp", "hsp", "airpods"]
            .iter()
            .any(|k| name.contains(k))
        {
            DeviceRoute::BluetoothSco
        } else if ["headset", "headphone", "wired", "usb"]
            .iter()
            .any(|k| name.contains(k))
        {
            DeviceRoute::WiredHeadset
        } else if name.contains("earpiece") || name.contains("receiver") {
            DeviceRoute::BuiltinEarpiece
        } else {
            DeviceRoute::BuiltinSpeaker
        }
    }
}

impl fmt::Display for DeviceRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceRoute::BluetoothSco => "bluetooth-sco",
            DeviceRoute::WiredHeadset => "wired-headset",
            DeviceRoute::BuiltinEarpiece => "earpiece",
            DeviceRoute::BuiltinSpeaker => "speaker",
        };
        f.write_str(name)
    }
}

/// Pick the highest-priority route among `available`
pub fn select_route(available: &[DeviceRoute]) -> Option<DeviceRoute> {
    available.iter().copied().max()
}

/// Device-level audio profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    #[default]
    Normal,
    /// Voice-call profile; platforms apply echo cancellation and noise
    /// suppression where they can
    Communication,
}
