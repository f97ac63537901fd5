//! Utility functions for the ble-gatt-bridge crate.

/// Normalise a Bluetooth address to upper-case, colon separated form.
///
/// # Example
///
/// ```
/// use ble_gatt_bridge::normalize_address;
///
/// assert_eq!(normalize_address("aa-bb-cc-dd-ee-ff"), "AA:BB:CC:DD:EE:FF");
/// ```
pub fn normalize_address(address: &str) -> String {
    address
        .trim()
        .chars()
        .map(|c| if c == '-' { ':' } else { c.to_ascii_uppercase() })
        .collect()
}

/// Compare two addresses ignoring case and separator style.
#[inline]
pub fn same_address(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

/// Check that an address has the `XX:XX:XX:XX:XX:XX` shape.
pub fn is_valid_address(address: &str) -> bool {
    let normalized = normalize_address(address);
    let parts: Vec<&str> = normalized.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}
