/// Cheap content fingerprint used to pair an optimistic draft with the copy
/// that later arrives from upstream.
///
/// This is the classic `h = h * 31 + c` string hash over UTF-16 code units
/// with 32-bit wrapping, so a browser client can compute the same value. It
/// is not collision resistant and is only ever compared together with the
/// author uid.
pub fn content_fingerprint(content: &str) -> u32 {
    content
        .trim()
        .encode_utf16()
        .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(u32::from(unit)))
}
