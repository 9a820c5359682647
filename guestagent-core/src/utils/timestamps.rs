use chrono::Utc;

/// Get timestamp in the wire format expected by the platform (YYYY-MM-DDTHH:MM:SS.fffZ)
pub fn get_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S.%3fZ").to_string()
}

/// Get RFC3339 timestamp
pub fn get_rfc3339_timestamp() -> String {
    Utc::now().to_rfc3339()
}
