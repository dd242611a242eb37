//! Hex formatting for frame dumps

/// Format bytes as spaced uppercase hex for log output
/// Example: [0x12, 0x34, 0xAB] -> "12 34 AB"
pub fn format_hex_pretty(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes as compact uppercase hex
/// Example: [0x12, 0x34, 0xAB] -> "1234AB"
pub fn format_hex(data: &[u8]) -> String {
    hex::encode_upper(data)
}
