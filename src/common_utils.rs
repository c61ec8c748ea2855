use chrono::Utc;

/// Get current timestamp in milliseconds (UTC)
pub fn get_current_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Get current time as an RFC 3339 string (UTC, millisecond precision)
pub fn get_current_iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ============================================================================
// Identifier generation
// ============================================================================
//
// Format: <prefix>_<unix ms>_<random hex>
// The millisecond component keeps identifiers roughly time-sortable and lets
// operators eyeball when a transfer entered the system.

/// Generate a transfer identifier: `tx_<ms>_<16 hex>`
pub fn generate_transfer_id() -> String {
    format!("tx_{}_{:016x}", get_current_timestamp_ms(), rand::random::<u64>())
}

/// Generate a batch identifier: `batch_<ms>_<8 hex>`
pub fn generate_batch_id() -> String {
    format!("batch_{}_{:08x}", get_current_timestamp_ms(), rand::random::<u32>())
}

/// Generate an event log identifier: `evt_<ms>_<6 hex>`
pub fn generate_event_id() -> String {
    format!("evt_{}_{:06x}", get_current_timestamp_ms(), rand::random::<u32>() & 0x00ff_ffff)
}
