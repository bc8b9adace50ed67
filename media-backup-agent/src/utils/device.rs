//! Identity of the machine running the agent.

/// Host name, used in captions and notifications.
pub fn device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown-device".to_string())
}
