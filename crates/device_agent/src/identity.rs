use shared::{domain::DeviceId, error::ProtocolError};

pub const DEVICE_PREFIX: &str = "retrato_";
const SUFFIX_LEN: usize = 6;

/// Frame name built from the first six hex digits of a hardware or OS
/// machine identifier, e.g. `retrato_4f1c9a`.
pub fn device_id_from_machine_id(machine_id: &str) -> Result<DeviceId, ProtocolError> {
    let suffix: String = machine_id
        .chars()
        .filter(char::is_ascii_hexdigit)
        .take(SUFFIX_LEN)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if suffix.len() < SUFFIX_LEN {
        return Err(ProtocolError::InvalidDeviceId(machine_id.trim().to_string()));
    }
    DeviceId::parse(&format!("{DEVICE_PREFIX}{suffix}"))
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
