// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::Rng;

/// Generates a random ingester UUID (16 bytes) and returns:
/// - `[u8; 16]` for direct use as `ConnConfig::ingester_uuid`
/// - `String` containing its hexadecimal representation (no prefix), as
///   stored in `MuxerConfig::ingester_uuid`
pub fn generate_ingester_uuid() -> ([u8; 16], String) {
    let mut uuid = [0u8; 16];
    rand::rng().fill(&mut uuid);

    let mut hex = String::with_capacity(32);
    for byte in &uuid {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }

    (uuid, hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingester_uuid_generation() {
        let (bytes, hex) = generate_ingester_uuid();
        assert_eq!(bytes.len(), 16);
        assert_eq!(hex.len(), 32);
        let decoded = hex::decode(&hex).expect("failed decode");
        assert_eq!(decoded, bytes);
    }
}
