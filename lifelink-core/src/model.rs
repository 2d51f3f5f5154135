use serde::{Deserialize, Serialize};

use crate::{ANONYMOUS_DISPLAY_NAME, CoreError, DeviceTag, MAX_MESSAGE_BODY_BYTES};

pub type MessageId = String;

/// Session user as handed over by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub mime_type: String,
}

/// A stored message as delivered by the live query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub sender_display_name: String,
    pub sender_email: String,
    pub sender_avatar_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Server timestamp in unix milliseconds; `None` while the write is pending.
    pub sent_at: Option<u64>,
    /// Backend sequencing used to order messages that share a timestamp.
    #[serde(default)]
    pub sequence: u64,
    pub origin_device_tag: DeviceTag,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.sent_at.is_none()
    }

    /// Ascending display key. Pending messages sort after everything that
    /// already has a server timestamp.
    pub fn display_key(&self) -> (bool, u64, u64) {
        (
            self.sent_at.is_none(),
            self.sent_at.unwrap_or(u64::MAX),
            self.sequence,
        )
    }

    /// Materialize a draft once the backend has assigned its identity.
    pub fn from_draft(draft: NewMessage, receipt: &WriteReceipt, sequence: u64) -> Self {
        Self {
            id: receipt.id.clone(),
            sender_id: draft.sender_id,
            sender_display_name: draft.sender_display_name,
            sender_email: draft.sender_email,
            sender_avatar_url: draft.sender_avatar_url,
            body: draft.body,
            attachment: draft.attachment,
            sent_at: Some(receipt.sent_at),
            sequence,
            origin_device_tag: draft.origin_device_tag,
        }
    }
}

/// A message as written by this client. Identifier, timestamp and sequence
/// are left for the backend to assign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: String,
    pub sender_display_name: String,
    pub sender_email: String,
    pub sender_avatar_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub origin_device_tag: DeviceTag,
}

impl NewMessage {
    pub fn text(sender: &Identity, body: impl Into<String>, device: DeviceTag) -> Self {
        Self::from_sender(sender, Some(body.into()), None, device)
    }

    pub fn file(sender: &Identity, attachment: Attachment, device: DeviceTag) -> Self {
        Self::from_sender(sender, None, Some(attachment), device)
    }

    fn from_sender(
        sender: &Identity,
        body: Option<String>,
        attachment: Option<Attachment>,
        device: DeviceTag,
    ) -> Self {
        Self {
            sender_id: sender.uid.clone(),
            sender_display_name: sender
                .display_name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| ANONYMOUS_DISPLAY_NAME.to_owned()),
            sender_email: sender.email.clone().unwrap_or_default(),
            sender_avatar_url: sender.avatar_url.clone().unwrap_or_default(),
            body,
            attachment,
            origin_device_tag: device,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let has_body = self.body.as_deref().is_some_and(|b| !b.trim().is_empty());
        if !has_body && self.attachment.is_none() {
            return Err(CoreError::EmptyMessage);
        }
        let len = self.body.as_deref().map_or(0, str::len);
        if len > MAX_MESSAGE_BODY_BYTES {
            return Err(CoreError::BodyTooLarge {
                len,
                max: MAX_MESSAGE_BODY_BYTES,
            });
        }
        Ok(())
    }
}

/// What the document store hands back for an accepted append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteReceipt {
    pub id: MessageId,
    pub sent_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            uid: "uid-1".to_owned(),
            display_name: None,
            email: Some("a@example.com".to_owned()),
            avatar_url: None,
        }
    }

    #[test]
    fn sender_snapshot_fills_defaults() {
        let draft = NewMessage::text(&identity(), "hi", DeviceTag::Desktop);
        assert_eq!(draft.sender_display_name, "Anonymous");
        assert_eq!(draft.sender_email, "a@example.com");
        assert_eq!(draft.sender_avatar_url, "");
        assert!(draft.attachment.is_none());
    }

    #[test]
    fn blank_draft_is_rejected() {
        let draft = NewMessage::text(&identity(), "   ", DeviceTag::Mobile);
        assert!(matches!(draft.validate(), Err(CoreError::EmptyMessage)));
    }

    #[test]
    fn body_over_limit_is_rejected() {
        let at_limit = "x".repeat(MAX_MESSAGE_BODY_BYTES);
        assert!(NewMessage::text(&identity(), &at_limit, DeviceTag::Desktop)
            .validate()
            .is_ok());

        let over = "é".repeat(MAX_MESSAGE_BODY_BYTES / 2 + 1);
        assert!(matches!(
            NewMessage::text(&identity(), &over, DeviceTag::Desktop).validate(),
            Err(CoreError::BodyTooLarge { len, .. }) if len == MAX_MESSAGE_BODY_BYTES + 2
        ));
    }

    #[test]
    fn pending_messages_sort_last() {
        let receipt = WriteReceipt {
            id: "m1".to_owned(),
            sent_at: 10,
        };
        let stored = Message::from_draft(
            NewMessage::text(&identity(), "a", DeviceTag::Desktop),
            &receipt,
            1,
        );
        let mut pending = stored.clone();
        pending.sent_at = None;
        assert!(pending.is_pending());
        assert!(stored.display_key() < pending.display_key());
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let draft = NewMessage::text(&identity(), "hello", DeviceTag::Tablet);
        let json = serde_json::to_value(&draft).unwrap();
        assert!(json.get("attachment").is_none());
        assert_eq!(json["origin_device_tag"], "[TAB]");
    }
}
