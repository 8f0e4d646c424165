//! Principal-name comparison with delegated (proxy) identities.
//!
//! A delegated identity is the delegator's name followed by one or more
//! [`PROXY_SUFFIX`] components. Both sides are stripped of every trailing
//! suffix before comparison, so any delegation depth is accepted.

use tracing::debug;

use crate::SecurityContext;

/// Name component appended once per delegation step.
pub const PROXY_SUFFIX: &str = "/CN=proxy";

/// Remove every trailing [`PROXY_SUFFIX`].
pub fn strip_proxy_suffixes(name: &str) -> &str {
    let mut rest = name;
    while let Some(stripped) = rest.strip_suffix(PROXY_SUFFIX) {
        rest = stripped;
    }
    rest
}

/// Byte-exact comparison after stripping proxy suffixes from both names.
pub fn names_match(a: &str, b: &str) -> bool {
    strip_proxy_suffixes(a) == strip_proxy_suffixes(b)
}

/// True when the context's two endpoints carry the same base identity.
///
/// Used when a collector is expected to run under the same identity as this
/// process (possibly delegated).
pub fn verify_peer_match(ctx: &SecurityContext) -> bool {
    let source = ctx.source_name();
    let target = ctx.target_name();
    let matched = names_match(source, target);
    debug!(source, target, matched, "peer identity comparison");
    matched
}
