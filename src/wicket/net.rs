use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Wicket's flags and docs accept the shorthand `":PORT"` to mean "bind on
/// all interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not
/// accept `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}
