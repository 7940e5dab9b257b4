//! Events carried by the hub.

use serde::Serialize;

use crate::db::{PingSnapshot, StatusKind, StatusSnapshot};

/// Everything a subscriber can be sent.
///
/// Serialises with a `type` tag, so an update reads
/// `{"type":"update","ping":{..},"status":{..}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A status snapshot on its own, e.g. from a backlog.
    Status(StatusSnapshot),
    /// A single probe result on its own.
    Ping(PingSnapshot),
    /// A completed check: the result and the status it produced.
    Update(CheckUpdate),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckUpdate {
    pub ping: PingSnapshot,
    pub status: StatusSnapshot,
}

impl Event {
    pub fn server_id(&self) -> i64 {
        match self {
            Event::Status(s) => s.status.server_id,
            Event::Ping(p) => p.ping.server_id,
            Event::Update(u) => u.status.status.server_id,
        }
    }

    /// The server name as it was when the event was built.
    pub fn server_name(&self) -> &str {
        match self {
            Event::Status(s) => &s.name,
            Event::Ping(p) => &p.name,
            Event::Update(u) => &u.status.name,
        }
    }

    /// The aggregate status this event reports, if it reports one.
    pub fn status_kind(&self) -> Option<StatusKind> {
        match self {
            Event::Status(s) => Some(s.status.status),
            Event::Ping(_) => None,
            Event::Update(u) => Some(u.status.status.status),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_update_wire_shape() {
        let event = update(4, "api", StatusKind::Degraded);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["status"]["server_id"], 4);
        assert_eq!(json["status"]["status"], "degraded");
        assert_eq!(json["status"]["name"], "api");
        assert_eq!(json["ping"]["status"], "success");
    }

    #[test]
    fn test_event_accessors() {
        let event = Event::Ping(ping(9, "db"));
        assert_eq!(event.server_id(), 9);
        assert_eq!(event.server_name(), "db");
        assert_eq!(event.status_kind(), None);

        let event = Event::Status(status(2, "web", StatusKind::Down));
        assert_eq!(event.status_kind(), Some(StatusKind::Down));
    }
}
