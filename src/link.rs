//! Universal link generation.
//!
//! The universal link wakes the wallet application and carries everything it
//! needs to pair: protocol version, our session id and the connect request.
//!
//! # Example URL
//!
//! ```text
//! https://wallet.example/ton-connect?v=2&id=<session id>&r=<connect request json>
//! ```
//!
//! Telegram mini-app links cannot carry arbitrary query strings: the host only
//! forwards a single `startattach` parameter restricted to `[A-Za-z0-9_-]`.
//! For those links the query string above is packed into that parameter:
//!
//! ```text
//! https://t.me/wallet?attach=wallet&startattach=tonconnect-v__2-id__<id>-r__<escaped>
//! ```

use url::{form_urlencoded, Url};

use crate::error::BridgeError;
use crate::protocol::{ConnectRequest, PROTOCOL_VERSION};

/// Universal link used when the wallet is not known in advance.
pub const STANDARD_UNIVERSAL_LINK: &str = "tc://";

/// Query parameter Telegram forwards to mini-apps.
pub const TELEGRAM_START_PARAM: &str = "startattach";

/// Prefix identifying a packed connect request inside `startattach`.
pub const TELEGRAM_START_PREFIX: &str = "tonconnect-";

/// Build the link that opens the wallet with a connect request.
pub fn generate_universal_link(
    universal_link: &str,
    session_id: &str,
    request: &ConnectRequest,
) -> Result<String, BridgeError> {
    let query = connect_query(session_id, request)?;

    if is_telegram_url(universal_link) {
        let start_param = format!(
            "{TELEGRAM_START_PREFIX}{}",
            encode_telegram_start_param(&query)
        );
        return append_query_pair(universal_link, TELEGRAM_START_PARAM, &start_param);
    }

    let mut url = parse_url(universal_link)?;
    // `query` is already form-encoded; splice it after any existing parameters
    let joined = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
        _ => query,
    };
    url.set_query(Some(&joined));
    Ok(url.to_string())
}

/// Returns `true` for links handled by Telegram (`tg:` scheme or `t.me` host).
pub fn is_telegram_url(link: &str) -> bool {
    match Url::parse(link) {
        Ok(url) => url.scheme() == "tg" || url.host_str() == Some("t.me"),
        Err(_) => false,
    }
}

/// Append a return strategy (`back`, `none` or a URL) to a universal link.
pub fn add_return_strategy(link: &str, strategy: &str) -> Result<String, BridgeError> {
    if !is_telegram_url(link) {
        return append_query_pair(link, "ret", strategy);
    }

    let mut url = parse_url(link)?;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let form_encoded: String = form_urlencoded::byte_serialize(strategy.as_bytes()).collect();
    let encoded_strategy = encode_telegram_start_param(&form_encoded);
    match pairs.iter_mut().find(|(k, _)| k == TELEGRAM_START_PARAM) {
        Some((_, value)) => {
            value.push_str("-ret__");
            value.push_str(&encoded_strategy);
        }
        None => pairs.push((
            TELEGRAM_START_PARAM.to_string(),
            format!("{TELEGRAM_START_PREFIX}ret__{encoded_strategy}"),
        )),
    }

    url.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(url.to_string())
}

/// Form-encoded `v`, `id` and `r` parameters.
fn connect_query(session_id: &str, request: &ConnectRequest) -> Result<String, BridgeError> {
    let request_json =
        serde_json::to_string(request).map_err(|e| BridgeError::InvalidMessage(e.to_string()))?;

    Ok(form_urlencoded::Serializer::new(String::new())
        .append_pair("v", &PROTOCOL_VERSION.to_string())
        .append_pair("id", session_id)
        .append_pair("r", &request_json)
        .finish())
}

/// Pack a form-encoded query string into Telegram's start parameter alphabet.
///
/// Order matters: the `%` produced by the first three steps is itself
/// rewritten by the last one.
pub fn encode_telegram_start_param(query: &str) -> String {
    query
        .replace('.', "%2E")
        .replace('-', "%2D")
        .replace('_', "%5F")
        .replace('&', "-")
        .replace('=', "__")
        .replace('%', "--")
}

/// Reverse of [`encode_telegram_start_param`], as a wallet would apply it.
///
/// Accepts the value with or without the `tonconnect-` prefix.
pub fn decode_telegram_start_param(param: &str) -> Result<String, BridgeError> {
    let body = param.strip_prefix(TELEGRAM_START_PREFIX).unwrap_or(param);

    // `%` only ever precedes two hex digits, which tells `--XX` (escape) apart
    // from `-` (`&`) followed by an escape.
    let chars: Vec<char> = body.chars().collect();
    let mut out = String::with_capacity(body.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '-' => {
                let escape = chars.get(i + 1) == Some(&'-')
                    && chars.get(i + 2).is_some_and(char::is_ascii_hexdigit)
                    && chars.get(i + 3).is_some_and(char::is_ascii_hexdigit);
                if escape {
                    out.push('%');
                    i += 2;
                } else {
                    out.push('&');
                    i += 1;
                }
            }
            '_' => {
                if chars.get(i + 1) != Some(&'_') {
                    return Err(BridgeError::InvalidUrl(format!(
                        "unpaired '_' in start parameter: {param}"
                    )));
                }
                out.push('=');
                i += 2;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    Ok(out
        .replace("%5F", "_")
        .replace("%2D", "-")
        .replace("%2E", "."))
}

fn append_query_pair(link: &str, key: &str, value: &str) -> Result<String, BridgeError> {
    let mut url = parse_url(link)?;
    url.query_pairs_mut().append_pair(key, value);
    Ok(url.to_string())
}

fn parse_url(link: &str) -> Result<Url, BridgeError> {
    Url::parse(link).map_err(|e| BridgeError::InvalidUrl(format!("{link}: {e}")))
}
