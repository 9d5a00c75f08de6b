//! Server-to-client WebSocket framing. Frames are never masked.

/// FIN bit set, text opcode.
pub const TEXT_FRAME_HEADER: u8 = 0x81;

/// Encodes `payload` as a single unmasked text frame.
pub fn encode_text_frame(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let len = bytes.len();
    let mut frame = Vec::with_capacity(len + 10);
    frame.push(TEXT_FRAME_HEADER);

    if len <= 125 {
        frame.push(len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(bytes);
    frame
}
