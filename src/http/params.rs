//! Decoding of `key=value&key2=value2` parameter strings.
//!
//! Used for both URL query strings and `application/x-www-form-urlencoded`
//! request bodies. `+` decodes to a space and `%XX` escapes are
//! percent-decoded; invalid UTF-8 is replaced rather than rejected.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;

/// Decodes a single urlencoded component.
pub fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Parses a parameter string into `params`. Later keys overwrite earlier ones.
pub fn parse_into(raw: &str, params: &mut HashMap<String, String>) {
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(decode_component(key), decode_component(value));
    }
}
