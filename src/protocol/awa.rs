/// Append an Awa frame (HyperSerialPico): `Awa`, LED count − 1 (big-endian),
/// header CRC, pixel data, then three Fletcher checksum bytes.
pub fn encode_awa_frame(frame: &mut Vec<u8>, pixel_data: &[u8], stride: usize) {
    let led_count = pixel_data.len() / stride;
    let [count_hi, count_lo] = (led_count.saturating_sub(1) as u16).to_be_bytes();

    frame.reserve(6 + pixel_data.len() + 3);
    frame.extend_from_slice(b"Awa");
    frame.extend_from_slice(&[count_hi, count_lo, (count_hi ^ count_lo) ^ 0x55]);
    frame.extend_from_slice(pixel_data);
    frame.extend_from_slice(&fletcher(pixel_data));
}

fn fletcher(pixel_data: &[u8]) -> [u8; 3] {
    let mut fletcher1: u16 = 0;
    let mut fletcher2: u16 = 0;
    let mut fletcher_ext: u16 = 0;

    for (position, &byte) in pixel_data.iter().enumerate() {
        let byte = u16::from(byte);
        fletcher1 = (fletcher1 + byte) % 255;
        fletcher2 = (fletcher2 + fletcher1) % 255;
        fletcher_ext = (fletcher_ext + (byte ^ position as u16)) % 255;
    }

    // 0x41 would look like the start of the next header
    if fletcher_ext == 0x41 {
        fletcher_ext = 0xaa;
    }

    [fletcher1 as u8, fletcher2 as u8, fletcher_ext as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_awa_header_counts_from_zero() {
        let mut frame = Vec::new();
        encode_awa_frame(&mut frame, &[0u8; 3 * 256], 3);
        assert_eq!(&frame[..6], &[b'A', b'w', b'a', 0x00, 0xFF, 0xFF ^ 0x55]);
        assert_eq!(frame.len(), 6 + 768 + 3);
    }

    #[test]
    fn test_awa_checksums() {
        let mut frame = Vec::new();
        encode_awa_frame(&mut frame, &[1, 2, 3], 3);
        // f1: 1, 3, 6; f2: 1, 4, 10; ext: 1^0, 2^1, 3^2 = 1, 3, 1 -> 5
        assert_eq!(&frame[frame.len() - 3..], &[6, 10, 5]);
    }

    #[test]
    fn test_awa_empty_frame_does_not_underflow() {
        let mut frame = Vec::new();
        encode_awa_frame(&mut frame, &[], 3);
        assert_eq!(&frame[3..5], &[0, 0]);
    }
}
