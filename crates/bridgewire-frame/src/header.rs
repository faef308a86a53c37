//! Header lists and the static header-name token table.

/// Token written in place of a table index when the name is sent literally.
pub const LITERAL_HEADER_NAME: u16 = 0xFFFF;

/// Header names with a compact `u16` token, indexed by token.
///
/// The order is part of the wire format.
pub const HEADER_NAME_TOKENS: [&str; 29] = [
    "host",
    "connection",
    "user-agent",
    "accept",
    "accept-encoding",
    "accept-language",
    "content-type",
    "content-length",
    "transfer-encoding",
    "cookie",
    "set-cookie",
    "cache-control",
    "pragma",
    "upgrade",
    "authorization",
    "origin",
    "referer",
    "location",
    "server",
    "date",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-request-id",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
];

/// Ordered header entries. Names may repeat.
pub type Headers = Vec<(String, String)>;

/// Token for `name`, compared case-insensitively.
pub fn token_for(name: &str) -> Option<u16> {
    HEADER_NAME_TOKENS
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(name))
        .map(|index| index as u16)
}

/// Lower-case name for a table token.
pub fn name_for(token: u16) -> Option<&'static str> {
    HEADER_NAME_TOKENS.get(usize::from(token)).copied()
}

/// First value for `name`, compared case-insensitively.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// `Connection` lists `upgrade` and `Upgrade` is `websocket`.
pub fn is_websocket_upgrade(headers: &[(String, String)]) -> bool {
    let connection_upgrade = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade
        && header_value(headers, "upgrade")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"))
}
