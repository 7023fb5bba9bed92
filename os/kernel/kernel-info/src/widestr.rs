//! # Wide-String Helpers
//!
//! The kernel command line crosses the hand-off boundary as a null-terminated
//! wide (UTF-16 code unit) string. These helpers implement the token
//! matching the boot-info consumer is specified against: a parameter matches
//! only at the start of the string or after a space, and only if followed by
//! end-of-string, a space, or `=`.
//!
//! Comparisons are case-insensitive over ASCII, which is all the parameter
//! namespace uses.

use kernel_status::Status;

/// Length of a null-terminated wide string, in code units.
///
/// # Safety
/// `s` must point at a readable, null-terminated sequence of `u16`.
#[must_use]
pub unsafe fn wide_len(s: *const u16) -> usize {
    let mut len = 0usize;
    // SAFETY: caller guarantees termination.
    unsafe {
        while *s.add(len) != 0 {
            len += 1;
        }
    }
    len
}

/// Borrows a null-terminated wide string as a slice (terminator excluded).
///
/// # Safety
/// `s` must point at a readable, null-terminated sequence of `u16` that
/// outlives the returned slice.
#[must_use]
pub unsafe fn wide_slice<'a>(s: *const u16) -> &'a [u16] {
    unsafe { core::slice::from_raw_parts(s, wide_len(s)) }
}

/// ASCII upper-casing of one wide character; non-ASCII passes through.
#[inline]
#[must_use]
pub const fn wide_upper(c: u16) -> u16 {
    if c >= b'a' as u16 && c <= b'z' as u16 {
        c - 0x20
    } else {
        c
    }
}

/// Case-insensitive equality of two wide slices.
#[must_use]
pub fn wide_eq_insensitive(a: &[u16], b: &[u16]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(&x, &y)| wide_upper(x) == wide_upper(y))
}

/// Case-insensitive search; returns the index of the first occurrence of
/// `needle` in `haystack`.
#[must_use]
pub fn wide_find_insensitive(haystack: &[u16], needle: &[u16]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&start| wide_eq_insensitive(&haystack[start..start + needle.len()], needle))
}

/// Compares a wide slice against an ASCII needle, case-insensitively.
#[must_use]
pub fn wide_eq_ascii(a: &[u16], ascii: &str) -> bool {
    a.len() == ascii.len()
        && a.iter()
            .zip(ascii.bytes())
            .all(|(&x, y)| wide_upper(x) == wide_upper(u16::from(y)))
}

/// Splits `s` at any of the ASCII `separators`, skipping empty pieces.
pub fn wide_tokenize<'a>(
    s: &'a [u16],
    separators: &'a [u8],
) -> impl Iterator<Item = &'a [u16]> + 'a {
    s.split(move |&c| separators.iter().any(|&sep| u16::from(sep) == c))
        .filter(|piece| !piece.is_empty())
}

/// Locates `name` as a whole token of the command line.
///
/// A match must begin at the start of the string or after a space, and end at
/// the end of the string, a space, or `=`. Returns the index of the first
/// character of the matched token.
///
/// # Errors
/// [`Status::InvalidParameter`] for an empty name, [`Status::NotFound`] when
/// no whole-token match exists.
pub fn find_parameter(command_line: &[u16], name: &str) -> Result<usize, Status> {
    if name.is_empty() {
        return Err(Status::InvalidParameter);
    }

    let mut needle = [0u16; 64];
    if name.len() > needle.len() {
        return Err(Status::InvalidParameter);
    }
    for (slot, byte) in needle.iter_mut().zip(name.bytes()) {
        *slot = u16::from(byte);
    }
    let needle = &needle[..name.len()];

    let mut search_start = 0usize;
    while let Some(offset) = wide_find_insensitive(&command_line[search_start..], needle) {
        let start = search_start + offset;
        let end = start + needle.len();

        let starts_token = start == 0 || command_line[start - 1] == u16::from(b' ');
        let ends_token = end == command_line.len()
            || command_line[end] == u16::from(b' ')
            || command_line[end] == u16::from(b'=');

        if starts_token && ends_token {
            return Ok(start);
        }

        // Substring of a larger token; keep searching past it.
        search_start = start + 1;
    }

    Err(Status::NotFound)
}

/// The value of a `NAME=VALUE` parameter, up to the next space.
///
/// A bare `NAME` token yields an empty value slice.
///
/// # Errors
/// Propagates [`find_parameter`]'s errors.
pub fn parameter_value<'a>(command_line: &'a [u16], name: &str) -> Result<&'a [u16], Status> {
    let start = find_parameter(command_line, name)?;
    let rest = &command_line[start + name.len()..];
    if rest.first() != Some(&u16::from(b'=')) {
        return Ok(&rest[..0]);
    }
    let value = &rest[1..];
    let end = value
        .iter()
        .position(|&c| c == u16::from(b' '))
        .unwrap_or(value.len());
    Ok(&value[..end])
}

/// Whether a boolean parameter is enabled.
///
/// Present without a value counts as true; `=0`, `=off`, `=no` and `=false`
/// count as false; anything else present counts as true.
#[must_use]
pub fn boolean_parameter(command_line: &[u16], name: &str) -> bool {
    match parameter_value(command_line, name) {
        Err(_) => false,
        Ok(value) if value.is_empty() => true,
        Ok(value) => {
            !(wide_eq_ascii(value, "0")
                || wide_eq_ascii(value, "off")
                || wide_eq_ascii(value, "no")
                || wide_eq_ascii(value, "false"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn whole_token_matching() {
        let cmdline = w("DEBUG=COM1,115200 NOXPA XPA=0");

        // NOXPA matches as a whole token.
        let start = find_parameter(&cmdline, "NOXPA").unwrap();
        assert_eq!(cmdline[start], u16::from(b'N'));
        assert_eq!(start, 18);

        // XPA matches the XPA=0 token, not the tail of NOXPA.
        let start = find_parameter(&cmdline, "XPA").unwrap();
        assert_eq!(start, 24);

        // Prefixes do not match.
        assert_eq!(find_parameter(&cmdline, "XP"), Err(Status::NotFound));
        assert_eq!(find_parameter(&cmdline, "DEBU"), Err(Status::NotFound));

        // Matching is case-insensitive.
        assert_eq!(find_parameter(&cmdline, "noxpa").unwrap(), 18);

        assert_eq!(find_parameter(&cmdline, ""), Err(Status::InvalidParameter));
    }

    #[test]
    fn value_extraction() {
        let cmdline = w("DEBUG=COM1,115200 NOXPA XPA=0");
        assert_eq!(
            parameter_value(&cmdline, "DEBUG").unwrap(),
            w("COM1,115200").as_slice()
        );
        assert_eq!(parameter_value(&cmdline, "NOXPA").unwrap(), &[] as &[u16]);
        assert_eq!(parameter_value(&cmdline, "XPA").unwrap(), w("0").as_slice());
    }

    #[test]
    fn boolean_parameters() {
        let cmdline = w("NOXPA XPA=0 TRACE=off VERBOSE=1");
        assert!(boolean_parameter(&cmdline, "NOXPA"));
        assert!(!boolean_parameter(&cmdline, "XPA"));
        assert!(!boolean_parameter(&cmdline, "TRACE"));
        assert!(boolean_parameter(&cmdline, "VERBOSE"));
        assert!(!boolean_parameter(&cmdline, "MISSING"));
    }

    #[test]
    fn tokenizer_skips_empty_pieces() {
        let value = w("COM1,115200;;SCREEN");
        let tokens: Vec<&[u16]> = wide_tokenize(&value, b";").collect();
        assert_eq!(tokens.len(), 2);
        assert!(wide_eq_ascii(tokens[0], "COM1,115200"));
        assert!(wide_eq_ascii(tokens[1], "SCREEN"));
    }

    #[test]
    fn raw_length_helpers() {
        let buffer: Vec<u16> = w("ABC\0junk");
        unsafe {
            assert_eq!(wide_len(buffer.as_ptr()), 3);
            assert_eq!(wide_slice(buffer.as_ptr()), w("ABC").as_slice());
        }
    }
}
