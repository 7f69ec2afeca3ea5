use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = tugo_common::id::prefixed_ulid("sub");
/// assert!(id.starts_with("sub_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// STOMP subscription ids.
    pub const SUBSCRIPTION: &str = "sub";
    /// Client contexts taking part in refresh coordination.
    pub const CONTEXT: &str = "ctx";
}
