// SPDX-License-Identifier: GPL-3.0-only

//! Decoding of UDisks2 `ay` byte strings.
//!
//! UDisks2 reports device paths and mount points as NUL-terminated byte
//! arrays, not D-Bus strings.

/// Decode a NUL-terminated byte string, dropping the terminator and
/// anything after it.
pub(crate) fn decode_c_string_bytes(bytes: &[u8]) -> String {
    let raw = bytes.split(|b| *b == 0).next().unwrap_or(bytes);
    String::from_utf8_lossy(raw).to_string()
}

/// Decode a mount-point list, filtering out empty entries.
pub(crate) fn decode_mount_points(raw: Vec<Vec<u8>>) -> Vec<String> {
    raw.into_iter()
        .map(|bytes| decode_c_string_bytes(&bytes))
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_c_string_bytes_truncates_nul() {
        let bytes = b"/run/media/user/DISK\0garbage";
        assert_eq!(decode_c_string_bytes(bytes), "/run/media/user/DISK");
    }

    #[test]
    fn decode_mount_points_filters_empty_entries() {
        let decoded = decode_mount_points(vec![
            b"/mnt/a\0".to_vec(),
            b"\0".to_vec(),
            Vec::new(),
            b"/mnt/b".to_vec(),
        ]);

        assert_eq!(decoded, vec!["/mnt/a".to_string(), "/mnt/b".to_string()]);
    }
}
