//! Bot API wire types. Only the fields the bot reads are modelled.

use serde::{Deserialize, Serialize};

/// Response envelope shared by every Bot API method.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

impl User {
    /// `@username` when set, the full name otherwise.
    pub fn display_name(&self) -> String {
        match &self.username {
            Some(username) => format!("@{username}"),
            None => match &self.last_name {
                Some(last) => format!("{} {}", self.first_name, last),
                None => self.first_name.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

/// One entry of the `stickers` array of `createNewStickerSet`.
#[derive(Debug, Clone, Serialize)]
pub struct InputSticker {
    pub sticker: String,
    pub format: &'static str,
    pub emoji_list: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_with_message() {
        let json = r#"{
            "ok": true,
            "result": [{
                "update_id": 5,
                "message": {
                    "message_id": 9,
                    "from": {"id": 42, "is_bot": false, "first_name": "Miko", "username": "miko"},
                    "chat": {"id": 42, "type": "private"},
                    "date": 0,
                    "text": "/create 123456"
                }
            }]
        }"#;
        let response: ApiResponse<Vec<Update>> = serde_json::from_str(json).unwrap();
        let updates = response.result.unwrap();
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.text.as_deref(), Some("/create 123456"));
        assert_eq!(message.from.as_ref().unwrap().display_name(), "@miko");
    }

    #[test]
    fn test_parse_rate_limit_error() {
        let json = r#"{"ok": false, "error_code": 429, "description": "Too Many Requests", "parameters": {"retry_after": 7}}"#;
        let response: ApiResponse<bool> = serde_json::from_str(json).unwrap();
        assert!(!response.ok);
        assert_eq!(response.parameters.and_then(|p| p.retry_after), Some(7));
    }

    #[test]
    fn test_display_name_without_username() {
        let user = User {
            id: 1,
            is_bot: false,
            first_name: "Elite".to_string(),
            last_name: Some("Miko".to_string()),
            username: None,
        };
        assert_eq!(user.display_name(), "Elite Miko");
    }
}
