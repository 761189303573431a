//! Wire formats: the two ingestion protocols and the serial framings used to
//! drive LED controllers.

pub mod adalight;
pub mod awa;
pub mod ledburn;
pub mod opc;

use serde::{Deserialize, Serialize};

pub use adalight::encode_adalight_frame;
pub use awa::encode_awa_frame;

/// Serial framing spoken by an LED controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialProtocol {
    /// HyperSerial "Awa" frames with Fletcher checksums
    Awa,
    Adalight,
}

impl SerialProtocol {
    /// Encode `pixel_data` (already in the controller's byte order) into `frame`.
    pub fn encode_into(self, frame: &mut Vec<u8>, pixel_data: &[u8], stride: usize) {
        frame.clear();
        match self {
            SerialProtocol::Awa => encode_awa_frame(frame, pixel_data, stride),
            SerialProtocol::Adalight => encode_adalight_frame(frame, pixel_data, stride),
        }
    }
}
