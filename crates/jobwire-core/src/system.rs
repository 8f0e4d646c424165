use std::sync::OnceLock;

static ORIGIN: OnceLock<String> = OnceLock::new();

/// Name this agent reports as the origin of its updates (host name).
pub fn origin() -> &'static str {
    ORIGIN.get_or_init(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    })
}
