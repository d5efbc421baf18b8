use rand::Rng;

/// Expected database schema version
/// Both the on-device store and the central store must use this version
pub const EXPECTED_DB_VERSION: &str = "1";

/// File name of the on-device capture store inside the data directory
pub const LOCAL_STORE_FILE: &str = "captures.sqlite";

/// File name of the cross-process drain lock inside the data directory
pub const DRAIN_LOCK_FILE: &str = "drain.lock";

/// Generate a unique device ID, stored in the local store metadata
pub fn generate_device_id() -> String {
    format!(
        "dev_{}",
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(12)
            .map(char::from)
            .collect::<String>()
    )
}

/// Generate a client-side capture ID. Never reused.
pub fn generate_local_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
