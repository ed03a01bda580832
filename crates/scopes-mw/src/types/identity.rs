//! Servant identities

use uuid::Uuid;

/// Generate a fresh identity for a servant registered without one.
///
/// Identities are 32 lowercase hex digits, so they never contain the `#`
/// or `!` separators of the proxy string format.
pub fn generate_identity() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Return `identity` unless it is empty, in which case generate one.
pub fn identity_or_generate(identity: &str) -> String {
    if identity.is_empty() {
        generate_identity()
    } else {
        identity.to_string()
    }
}
