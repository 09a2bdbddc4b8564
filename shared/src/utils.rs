use base64::{engine::general_purpose as b64, Engine};
use url::Url;

pub fn b64_encode(bytes: &[u8]) -> String {
    b64::STANDARD.encode(bytes)
}

/// Decodes standard base64, tolerating the line breaks some providers insert.
pub fn b64_decode(str: &str) -> Option<Vec<u8>> {
    let compact: String = str.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    b64::STANDARD.decode(compact).ok()
}

pub fn query_item(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
#[test]
fn query_items_are_decoded() {
    let url = Url::parse("authenticator://oauth/redirect?access_token=a%2Bb&error_class=").unwrap();
    assert_eq!(query_item(&url, "access_token").as_deref(), Some("a+b"));
    assert_eq!(query_item(&url, "error_class"), None);
    assert_eq!(query_item(&url, "missing"), None);
}

#[cfg(test)]
#[test]
fn b64_decode_ignores_line_breaks() {
    assert_eq!(b64_decode("aGVs\nbG8=").as_deref(), Some(&b"hello"[..]));
    assert_eq!(b64_decode("not base64!"), None);
}
