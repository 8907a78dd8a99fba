use super::bookmark::Bookmark;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 书签表的变更事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum ChangeEvent {
    Inserted(Bookmark),
    Updated(Bookmark),
    Deleted(Uuid),
}

impl ChangeEvent {
    pub fn record_id(&self) -> Uuid {
        match self {
            ChangeEvent::Inserted(b) | ChangeEvent::Updated(b) => b.id,
            ChangeEvent::Deleted(id) => *id,
        }
    }
}

/// 数据库触发器通过 pg_notify 发送的负载
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeNotification {
    pub op: String,
    pub user_id: Uuid,
    pub record: Option<Bookmark>,
    pub old_id: Option<Uuid>,
}

impl ChangeNotification {
    pub fn into_event(self) -> Option<(Uuid, ChangeEvent)> {
        let event = match self.op.as_str() {
            "INSERT" => ChangeEvent::Inserted(self.record?),
            "UPDATE" => ChangeEvent::Updated(self.record?),
            "DELETE" => ChangeEvent::Deleted(self.old_id?),
            _ => return None,
        };
        Some((self.user_id, event))
    }
}

/// 列表视图状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewState {
    Loading,
    Ready,
    Disposed,
}

/// 推送给客户端的列表快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewFrame {
    pub state: ViewState,
    pub bookmarks: Vec<Bookmark>,
    pub error: Option<String>,
}

/// 推送给客户端的表单状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionFrame {
    pub url: String,
    pub title: String,
    pub error: Option<String>,
    pub success: bool,
}

/// 实时消息类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LiveMessageType {
    // 系统消息
    Connect,
    Ping,
    Pong,
    Error,

    // 视图消息
    View,
    Submission,

    // 客户端指令
    AddBookmark,
    DeleteBookmark,
}

/// 实时消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMessage {
    #[serde(default)]
    pub id: String,
    pub message_type: LiveMessageType,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddBookmarkCommand {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteBookmarkCommand {
    pub id: Uuid,
}

/// 错误消息
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

impl LiveMessage {
    pub fn new(message_type: LiveMessageType, data: serde_json::Value) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4()),
            message_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn connect(connection_id: &str, user_id: Uuid) -> Self {
        Self::new(
            LiveMessageType::Connect,
            serde_json::json!({
                "connection_id": connection_id,
                "user_id": user_id,
            }),
        )
    }

    /// Each bookmark also carries `href` (null unless http/https) and
    /// `domain` for display.
    pub fn view(frame: &ViewFrame) -> Self {
        let mut data = serde_json::to_value(frame).unwrap_or_default();
        if let Some(items) = data.get_mut("bookmarks").and_then(|b| b.as_array_mut()) {
            for (item, bookmark) in items.iter_mut().zip(&frame.bookmarks) {
                if let Some(fields) = item.as_object_mut() {
                    fields.insert("href".to_string(), serde_json::json!(bookmark.web_href()));
                    fields.insert("domain".to_string(), serde_json::json!(bookmark.domain()));
                }
            }
        }
        Self::new(LiveMessageType::View, data)
    }

    pub fn submission(frame: &SubmissionFrame) -> Self {
        Self::new(
            LiveMessageType::Submission,
            serde_json::to_value(frame).unwrap_or_default(),
        )
    }

    pub fn pong() -> Self {
        Self::new(LiveMessageType::Pong, serde_json::json!({ "timestamp": Utc::now() }))
    }

    pub fn error(code: &str, message: &str) -> Self {
        let error_data = ErrorMessage {
            code: code.to_string(),
            message: message.to_string(),
        };

        Self::new(
            LiveMessageType::Error,
            serde_json::to_value(error_data).unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_event_wire_format() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(ChangeEvent::Deleted(id)).unwrap();
        assert_eq!(json["event_type"], "deleted");
        assert_eq!(json["payload"], serde_json::json!(id));
    }

    #[test]
    fn test_notification_into_event() {
        let user_id = Uuid::new_v4();
        let old_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "op": "DELETE",
            "user_id": user_id,
            "record": null,
            "old_id": old_id,
        });

        let notification: ChangeNotification = serde_json::from_value(payload).unwrap();
        assert_eq!(
            notification.into_event(),
            Some((user_id, ChangeEvent::Deleted(old_id)))
        );
    }

    #[test]
    fn test_notification_with_unknown_op_is_dropped() {
        let notification = ChangeNotification {
            op: "TRUNCATE".to_string(),
            user_id: Uuid::new_v4(),
            record: None,
            old_id: None,
        };
        assert!(notification.into_event().is_none());
    }

    #[test]
    fn test_view_message_only_links_web_urls() {
        let user_id = Uuid::new_v4();
        let make = |url: &str| Bookmark {
            id: Uuid::new_v4(),
            user_id,
            url: url.to_string(),
            title: "t".to_string(),
            created_at: Utc::now(),
        };
        let frame = ViewFrame {
            state: ViewState::Ready,
            bookmarks: vec![make("https://www.example.com/x"), make("javascript://%0aalert(1)")],
            error: None,
        };

        let message = LiveMessage::view(&frame);
        let items = message.data["bookmarks"].as_array().unwrap();
        assert_eq!(items[0]["href"], "https://www.example.com/x");
        assert_eq!(items[0]["domain"], "example.com");
        assert!(items[1]["href"].is_null());
        assert_eq!(items[1]["url"], "javascript://%0aalert(1)");
    }

    #[test]
    fn test_error_message_creation() {
        let message = LiveMessage::error("INVALID_COMMAND", "Unknown command");
        assert_eq!(message.message_type, LiveMessageType::Error);
        assert_eq!(message.data["code"], "INVALID_COMMAND");
    }

    #[test]
    fn test_client_command_parsing() {
        let raw = r#"{"id":"c1","message_type":"add_bookmark","data":{"url":"https://example.com","title":"Example"},"timestamp":"2024-01-01T00:00:00Z"}"#;
        let message: LiveMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.message_type, LiveMessageType::AddBookmark);

        let command: AddBookmarkCommand = serde_json::from_value(message.data).unwrap();
        assert_eq!(command.title, "Example");
    }
}
