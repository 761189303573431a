/// Append an Adalight frame: `Ada`, LED count (big-endian), header checksum, pixel data.
pub fn encode_adalight_frame(frame: &mut Vec<u8>, pixel_data: &[u8], stride: usize) {
    let led_count = pixel_data.len() / stride;
    let [count_hi, count_lo] = (led_count as u16).to_be_bytes();

    frame.reserve(6 + pixel_data.len());
    frame.extend_from_slice(b"Ada");
    frame.extend_from_slice(&[count_hi, count_lo, count_hi ^ count_lo ^ 0x55]);
    frame.extend_from_slice(pixel_data);
}
