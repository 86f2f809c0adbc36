//! The `key:value` line format used by OpenID 1.x POST responses and by
//! signature base strings.

use std::collections::HashMap;

/// Parse a KV-form body into a map.
///
/// Records are `key:value` terminated by `\n`, split on the first colon.
/// Keys and values are trimmed of surrounding whitespace. Lines without a
/// colon are skipped.
pub fn parse(body: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in body.split('\n') {
        if let Some((key, value)) = line.split_once(':') {
            map.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    map
}

/// Emit KV-form records in the order given.
///
/// This is also the grammar of signature base strings, where the order is
/// the one named by `openid.signed`.
pub fn join<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str(key);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    out
}
