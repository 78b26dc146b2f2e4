/// Milliseconds since the Unix epoch, the unit persisted in user data.
pub type EpochMillis = i64;

/// Current wall-clock time in [`EpochMillis`].
pub fn now_millis() -> EpochMillis {
    chrono::Utc::now().timestamp_millis()
}
