//! Device state transitions expressed as history events.

use crate::entity::{Device, HistoryEvent, Trigger};
use crate::{HistoryId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// What happened to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    TurnOn,
    TurnOff,
    SetIntensity,
    SetTemperature,
    SetOnline,
    SetOffline,
    /// Anything this client does not know how to describe.
    #[default]
    #[serde(other)]
    Other,
}

/// One observed change between two versions of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChange {
    pub action: HistoryAction,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl DeviceChange {
    fn new(action: HistoryAction, old: impl ToString, new: impl ToString) -> Self {
        Self {
            action,
            old_value: Some(old.to_string()),
            new_value: Some(new.to_string()),
        }
    }

    /// Materialize the change as a history event.
    pub fn into_event(
        self,
        id: HistoryId,
        device_id: impl Into<String>,
        occurred_at: Timestamp,
        triggered_by: Trigger,
        actor_id: Option<UserId>,
    ) -> HistoryEvent {
        HistoryEvent {
            id,
            device_id: device_id.into(),
            action: self.action,
            old_value: self.old_value,
            new_value: self.new_value,
            occurred_at,
            triggered_by,
            actor_id,
            dirty: true,
            synced_at: None,
        }
    }
}

fn fmt_temperature(value: Option<f64>) -> String {
    value.map(|t| t.to_string()).unwrap_or_default()
}

/// List the state changes between `before` and `after`, power first.
///
/// Metadata edits (name, room, hardware reference) produce no events.
pub fn device_changes(before: &Device, after: &Device) -> Vec<DeviceChange> {
    let mut changes = Vec::new();

    if before.on != after.on {
        let action = if after.on {
            HistoryAction::TurnOn
        } else {
            HistoryAction::TurnOff
        };
        changes.push(DeviceChange::new(action, before.on, after.on));
    }

    if before.intensity != after.intensity {
        changes.push(DeviceChange::new(
            HistoryAction::SetIntensity,
            before.intensity,
            after.intensity,
        ));
    }

    if before.temperature != after.temperature {
        changes.push(DeviceChange::new(
            HistoryAction::SetTemperature,
            fmt_temperature(before.temperature),
            fmt_temperature(after.temperature),
        ));
    }

    if before.online != after.online {
        let action = if after.online {
            HistoryAction::SetOnline
        } else {
            HistoryAction::SetOffline
        };
        changes.push(DeviceChange::new(action, before.online, after.online));
    }

    changes
}
