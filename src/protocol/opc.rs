//! Open Pixel Control message framing.
//!
//! Every message is a 4-byte header (channel, command, length high, length
//! low) followed by exactly `length` payload bytes.

pub const HEADER_SIZE: usize = 4;

pub const CMD_SET_PIXELS: u8 = 0;
pub const CMD_SYSTEM_EXCLUSIVE: u8 = 255;

pub const SYSTEM_ID_FADECANDY: u16 = 1;
pub const SYSTEM_ID_LEDSCAPE: u16 = 2;

pub const LEDSCAPE_GET_CONFIG: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub channel: u8,
    pub command: u8,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    SetPixels(&'a [u8]),
    GetConfig,
    /// System-exclusive message for another system
    UnsupportedSystem(u16),
    UnsupportedSystemCommand(u8),
    /// System-exclusive payload too short to hold a system id and command
    Truncated(usize),
    Unsupported(u8),
}

/// Decode one message from the front of `buf`.
///
/// Returns the number of bytes consumed and the message, or `None` if the
/// buffer does not hold a complete message yet.
pub fn decode_message(buf: &[u8]) -> Option<(usize, Message<'_>)> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let length = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    let message_size = HEADER_SIZE + length;
    if buf.len() < message_size {
        return None;
    }

    let message = Message {
        channel: buf[0],
        command: buf[1],
        payload: &buf[HEADER_SIZE..message_size],
    };
    Some((message_size, message))
}

impl<'a> Message<'a> {
    pub fn command(&self) -> Command<'a> {
        match self.command {
            CMD_SET_PIXELS => Command::SetPixels(self.payload),
            CMD_SYSTEM_EXCLUSIVE => {
                if self.payload.len() < 3 {
                    return Command::Truncated(self.payload.len());
                }
                let system_id = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                if system_id != SYSTEM_ID_LEDSCAPE {
                    return Command::UnsupportedSystem(system_id);
                }
                match self.payload[2] {
                    LEDSCAPE_GET_CONFIG => Command::GetConfig,
                    other => Command::UnsupportedSystemCommand(other),
                }
            }
            other => Command::Unsupported(other),
        }
    }
}

/// Reply to a get-config request: the status text followed by a null byte.
pub fn config_reply(status_json: &str) -> Vec<u8> {
    let mut reply = Vec::with_capacity(status_json.len() + 1);
    reply.extend_from_slice(status_json.as_bytes());
    reply.push(0);
    reply
}

#[cfg(test)]
pub(crate) fn encode_message(channel: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u16;
    let mut buf = vec![channel, command];
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}
