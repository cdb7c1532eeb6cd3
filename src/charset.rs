// Bidirectional mapping between guest bytes and host characters. The real
// character set of a CP/M machine was whatever its terminal happened to
// render; we use ASCII for the low half and Latin-1 for the high half,
// which covers the bytes actual CP/M software emits. Both directions stay
// behind this interface so that a richer, configurable table can replace
// it without touching the callers.

/// Convert a guest byte to a host character. Returns None for bytes that
/// have no printable mapping on the host side.
pub fn from_cpm(byte: u8) -> Option<char> {
    char::from_u32(byte as u32)
}

/// Convert a host character to a guest byte. Characters outside the guest
/// character set are reported as None and skipped by the callers.
pub fn to_cpm(c: char) -> Option<u8> {
    let code = c as u32;
    if code <= 0xff {
        Some(code as u8)
    } else {
        None
    }
}

/// Printable form of a guest byte for hex dumps.
pub fn dump_char(byte: u8) -> char {
    if (0x21..=0x7e).contains(&byte) {
        byte as char
    } else {
        '.'
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trips() {
        for b in 0x20..=0x7eu8 {
            assert_eq!(to_cpm(from_cpm(b).unwrap()), Some(b));
        }
    }

    #[test]
    fn wide_characters_are_rejected() {
        assert_eq!(to_cpm('€'), None);
        assert_eq!(to_cpm('あ'), None);
    }
}
