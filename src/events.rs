//! Server notification events
//!
//! Notifications arrive as `notify<name>` lines. Each known name maps to an
//! `EventKind`, and its payload is validated into a typed `Event` before any
//! subscriber sees it.

use serde::Serialize;
use thiserror::Error;

use crate::protocol::{FieldError, Notification, Row};

/// Notification names the server can push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ClientEnterView,
    ClientLeftView,
    ClientMoved,
    TextMessage,
    ServerEdited,
    ChannelCreated,
    ChannelDeleted,
    ChannelEdited,
    ChannelMoved,
    ChannelDescriptionChanged,
    ChannelPasswordChanged,
    TokenUsed,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::ClientEnterView,
        EventKind::ClientLeftView,
        EventKind::ClientMoved,
        EventKind::TextMessage,
        EventKind::ServerEdited,
        EventKind::ChannelCreated,
        EventKind::ChannelDeleted,
        EventKind::ChannelEdited,
        EventKind::ChannelMoved,
        EventKind::ChannelDescriptionChanged,
        EventKind::ChannelPasswordChanged,
        EventKind::TokenUsed,
    ];

    /// Leading token of the notification line
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventKind::ClientEnterView => "notifycliententerview",
            EventKind::ClientLeftView => "notifyclientleftview",
            EventKind::ClientMoved => "notifyclientmoved",
            EventKind::TextMessage => "notifytextmessage",
            EventKind::ServerEdited => "notifyserveredited",
            EventKind::ChannelCreated => "notifychannelcreated",
            EventKind::ChannelDeleted => "notifychanneldeleted",
            EventKind::ChannelEdited => "notifychanneledited",
            EventKind::ChannelMoved => "notifychannelmoved",
            EventKind::ChannelDescriptionChanged => "notifychanneldescriptionchanged",
            EventKind::ChannelPasswordChanged => "notifychannelpasswordchanged",
            EventKind::TokenUsed => "notifytokenused",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

/// Event classes accepted by `servernotifyregister`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Server,
    Channel,
    TextServer,
    TextChannel,
    TextPrivate,
    TokenUsed,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Server => "server",
            EventClass::Channel => "channel",
            EventClass::TextServer => "textserver",
            EventClass::TextChannel => "textchannel",
            EventClass::TextPrivate => "textprivate",
            EventClass::TokenUsed => "tokenused",
        }
    }

    /// Notification kinds the server emits after registering for this class
    pub fn kinds(&self) -> &'static [EventKind] {
        match self {
            EventClass::Server => &[
                EventKind::ClientEnterView,
                EventKind::ClientLeftView,
                EventKind::ServerEdited,
            ],
            EventClass::Channel => &[
                EventKind::ClientEnterView,
                EventKind::ClientLeftView,
                EventKind::ClientMoved,
                EventKind::ChannelCreated,
                EventKind::ChannelDeleted,
                EventKind::ChannelEdited,
                EventKind::ChannelMoved,
                EventKind::ChannelDescriptionChanged,
                EventKind::ChannelPasswordChanged,
            ],
            EventClass::TextServer | EventClass::TextChannel | EventClass::TextPrivate => {
                &[EventKind::TextMessage]
            }
            EventClass::TokenUsed => &[EventKind::TokenUsed],
        }
    }
}

impl std::str::FromStr for EventClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(EventClass::Server),
            "channel" => Ok(EventClass::Channel),
            "textserver" => Ok(EventClass::TextServer),
            "textchannel" => Ok(EventClass::TextChannel),
            "textprivate" => Ok(EventClass::TextPrivate),
            "tokenused" => Ok(EventClass::TokenUsed),
            other => Err(format!("Invalid event class: {}", other)),
        }
    }
}

/// Payload validation failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown notification `{0}`")]
    Unknown(String),
    #[error("invalid `{event}` payload: {source}")]
    Field {
        event: &'static str,
        #[source]
        source: FieldError,
    },
}

/// Client that triggered an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invoker {
    pub id: u32,
    pub name: String,
    pub uid: Option<String>,
}

impl Invoker {
    fn from_row(row: &Row) -> Result<Option<Self>, FieldError> {
        let Some(id) = row.parse("invokerid")? else {
            return Ok(None);
        };
        Ok(Some(Invoker {
            id,
            name: row.get("invokername").unwrap_or_default().to_string(),
            uid: row.get("invokeruid").map(str::to_string),
        }))
    }
}

/// A validated notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ClientEnterView {
        clid: u32,
        cldbid: u64,
        nickname: String,
        unique_id: String,
        from_channel: u32,
        to_channel: u32,
        reason: u32,
        properties: Row,
    },
    ClientLeftView {
        clid: u32,
        from_channel: u32,
        to_channel: u32,
        reason: u32,
        reason_msg: Option<String>,
        invoker: Option<Invoker>,
    },
    ClientMoved {
        clid: u32,
        to_channel: u32,
        reason: u32,
        invoker: Option<Invoker>,
    },
    TextMessage {
        target_mode: u8,
        msg: String,
        target: Option<u32>,
        invoker: Invoker,
    },
    ServerEdited {
        reason: u32,
        invoker: Option<Invoker>,
        properties: Row,
    },
    ChannelCreated {
        cid: u32,
        cpid: Option<u32>,
        invoker: Option<Invoker>,
        properties: Row,
    },
    ChannelDeleted {
        cid: u32,
        invoker: Option<Invoker>,
    },
    ChannelEdited {
        cid: u32,
        reason: u32,
        invoker: Option<Invoker>,
        properties: Row,
    },
    ChannelMoved {
        cid: u32,
        cpid: u32,
        order: u32,
        invoker: Option<Invoker>,
    },
    ChannelDescriptionChanged {
        cid: u32,
    },
    ChannelPasswordChanged {
        cid: u32,
    },
    TokenUsed {
        clid: u32,
        cldbid: u64,
        cluid: String,
        token: String,
        custom_set: Option<String>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ClientEnterView { .. } => EventKind::ClientEnterView,
            Event::ClientLeftView { .. } => EventKind::ClientLeftView,
            Event::ClientMoved { .. } => EventKind::ClientMoved,
            Event::TextMessage { .. } => EventKind::TextMessage,
            Event::ServerEdited { .. } => EventKind::ServerEdited,
            Event::ChannelCreated { .. } => EventKind::ChannelCreated,
            Event::ChannelDeleted { .. } => EventKind::ChannelDeleted,
            Event::ChannelEdited { .. } => EventKind::ChannelEdited,
            Event::ChannelMoved { .. } => EventKind::ChannelMoved,
            Event::ChannelDescriptionChanged { .. } => EventKind::ChannelDescriptionChanged,
            Event::ChannelPasswordChanged { .. } => EventKind::ChannelPasswordChanged,
            Event::TokenUsed { .. } => EventKind::TokenUsed,
        }
    }

    /// Validate a raw notification into its typed payload
    pub fn from_notification(notification: &Notification) -> Result<Self, EventError> {
        let kind = EventKind::from_wire(&notification.name)
            .ok_or_else(|| EventError::Unknown(notification.name.clone()))?;
        Self::parse(kind, &notification.payload).map_err(|source| EventError::Field {
            event: kind.wire_name(),
            source,
        })
    }

    fn parse(kind: EventKind, row: &Row) -> Result<Self, FieldError> {
        let event = match kind {
            EventKind::ClientEnterView => Event::ClientEnterView {
                clid: row.require("clid")?,
                cldbid: row.require("client_database_id")?,
                nickname: row.require("client_nickname")?,
                unique_id: row.get("client_unique_identifier").unwrap_or_default().to_string(),
                from_channel: row.parse("cfid")?.unwrap_or(0),
                to_channel: row.require("ctid")?,
                reason: row.parse("reasonid")?.unwrap_or(0),
                properties: row.clone(),
            },
            EventKind::ClientLeftView => Event::ClientLeftView {
                clid: row.require("clid")?,
                from_channel: row.parse("cfid")?.unwrap_or(0),
                to_channel: row.parse("ctid")?.unwrap_or(0),
                reason: row.parse("reasonid")?.unwrap_or(0),
                reason_msg: row.get("reasonmsg").map(str::to_string),
                invoker: Invoker::from_row(row)?,
            },
            EventKind::ClientMoved => Event::ClientMoved {
                clid: row.require("clid")?,
                to_channel: row.require("ctid")?,
                reason: row.parse("reasonid")?.unwrap_or(0),
                invoker: Invoker::from_row(row)?,
            },
            EventKind::TextMessage => Event::TextMessage {
                target_mode: row.require("targetmode")?,
                msg: row.require("msg")?,
                target: row.parse("target")?,
                invoker: Invoker::from_row(row)?
                    .ok_or_else(|| FieldError::Missing("invokerid".to_string()))?,
            },
            EventKind::ServerEdited => Event::ServerEdited {
                reason: row.parse("reasonid")?.unwrap_or(0),
                invoker: Invoker::from_row(row)?,
                properties: row.clone(),
            },
            EventKind::ChannelCreated => Event::ChannelCreated {
                cid: row.require("cid")?,
                cpid: row.parse("cpid")?,
                invoker: Invoker::from_row(row)?,
                properties: row.clone(),
            },
            EventKind::ChannelDeleted => Event::ChannelDeleted {
                cid: row.require("cid")?,
                invoker: Invoker::from_row(row)?,
            },
            EventKind::ChannelEdited => Event::ChannelEdited {
                cid: row.require("cid")?,
                reason: row.parse("reasonid")?.unwrap_or(0),
                invoker: Invoker::from_row(row)?,
                properties: row.clone(),
            },
            EventKind::ChannelMoved => Event::ChannelMoved {
                cid: row.require("cid")?,
                cpid: row.require("cpid")?,
                order: row.parse("order")?.unwrap_or(0),
                invoker: Invoker::from_row(row)?,
            },
            EventKind::ChannelDescriptionChanged => Event::ChannelDescriptionChanged {
                cid: row.require("cid")?,
            },
            EventKind::ChannelPasswordChanged => Event::ChannelPasswordChanged {
                cid: row.require("cid")?,
            },
            EventKind::TokenUsed => Event::TokenUsed {
                clid: row.require("clid")?,
                cldbid: row.require("cldbid")?,
                cluid: row.require("cluid")?,
                token: row.require("token")?,
                custom_set: row.get("tokencustomset").map(str::to_string),
            },
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(name: &str, fields: &[(&str, &str)]) -> Notification {
        Notification {
            name: name.to_string(),
            payload: fields.iter().copied().collect(),
        }
    }

    #[test]
    fn test_wire_names_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.wire_name()), Some(kind));
        }
        assert_eq!(EventKind::from_wire("notifyunknown"), None);
    }

    #[test]
    fn test_parse_text_message() {
        let event = Event::from_notification(&notification(
            "notifytextmessage",
            &[
                ("targetmode", "3"),
                ("msg", "hi there"),
                ("invokerid", "12"),
                ("invokername", "alice"),
                ("invokeruid", "abc="),
            ],
        ))
        .unwrap();

        assert_eq!(
            event,
            Event::TextMessage {
                target_mode: 3,
                msg: "hi there".to_string(),
                target: None,
                invoker: Invoker {
                    id: 12,
                    name: "alice".to_string(),
                    uid: Some("abc=".to_string()),
                },
            }
        );
        assert_eq!(event.kind(), EventKind::TextMessage);
    }

    #[test]
    fn test_parse_client_moved_without_invoker() {
        let event = Event::from_notification(&notification(
            "notifyclientmoved",
            &[("ctid", "4"), ("reasonid", "0"), ("clid", "9")],
        ))
        .unwrap();
        assert_eq!(
            event,
            Event::ClientMoved {
                clid: 9,
                to_channel: 4,
                reason: 0,
                invoker: None,
            }
        );
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let err = Event::from_notification(&notification(
            "notifychanneldeleted",
            &[("invokerid", "1")],
        ))
        .unwrap_err();
        assert_eq!(
            err,
            EventError::Field {
                event: "notifychanneldeleted",
                source: FieldError::Missing("cid".to_string()),
            }
        );
    }

    #[test]
    fn test_unknown_notification_is_rejected() {
        let err = Event::from_notification(&notification("notifysomething", &[])).unwrap_err();
        assert_eq!(err, EventError::Unknown("notifysomething".to_string()));
    }

    #[test]
    fn test_event_class_kinds() {
        assert!(EventClass::Channel.kinds().contains(&EventKind::ClientMoved));
        assert_eq!(EventClass::TextPrivate.kinds(), &[EventKind::TextMessage]);
        assert_eq!("tokenused".parse::<EventClass>(), Ok(EventClass::TokenUsed));
        assert!("bogus".parse::<EventClass>().is_err());
    }
}
