pub mod error;

pub use error::{FrameError, ModbusError};

/// Hex dump used in frame debug logs, e.g. `01 03 00 00 00 01 84 0a`.
pub fn hex_frame(bytes: &[u8]) -> String {
    let encoded = hex::encode(bytes);
    encoded
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or("??"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_frame() {
        assert_eq!(hex_frame(&[0x01, 0x03, 0x84, 0x0A]), "01 03 84 0a");
        assert_eq!(hex_frame(&[]), "");
    }
}
