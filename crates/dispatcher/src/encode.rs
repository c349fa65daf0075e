use bouncer_core::EnforcementEvent;

use crate::DispatchError;

/// Serializes an event as a single-line JSON object, without the trailing
/// newline.
pub fn encode_event(event: &EnforcementEvent) -> Result<String, DispatchError> {
    serde_json::to_string(event).map_err(DispatchError::Encode)
}
