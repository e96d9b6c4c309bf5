//! Telegram Bot API client over reqwest.
//!
//! Handles 429 rate limits by respecting the `parameters.retry_after` field
//! returned in the JSON response body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use super::types::{ApiResponse, InputSticker, Update, User};
use super::{ChatPlatform, STICKER_EMOJI};
use crate::domain::{Sticker, StickerFormat};
use crate::utils::{fs, http_client};
use crate::{Error, Result};

/// Maximum number of attempts for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Long-poll timeout passed to `getUpdates`.
pub const LONG_POLL_TIMEOUT_SECS: u64 = 30;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// A file attached to a multipart request.
#[derive(Debug, Clone)]
struct UploadFile {
    field: String,
    file_name: String,
    mime: &'static str,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
enum Payload {
    Json(serde_json::Value),
    Multipart {
        fields: Vec<(&'static str, String)>,
        files: Vec<UploadFile>,
    },
}

impl Payload {
    /// Multipart forms are single-use, so the body is rebuilt per attempt.
    fn apply(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        match self {
            Self::Json(value) => Ok(request.json(value)),
            Self::Multipart { fields, files } => {
                let mut form = Form::new();
                for (name, value) in fields {
                    form = form.text(*name, value.clone());
                }
                for file in files {
                    let part = Part::bytes(file.bytes.clone())
                        .file_name(file.file_name.clone())
                        .mime_str(file.mime)?;
                    form = form.part(file.field.clone(), part);
                }
                Ok(request.multipart(form))
            }
        }
    }
}

/// Telegram Bot API client.
pub struct TelegramClient {
    client: Client,
    api_base: String,
    /// User that owns created sticker sets.
    owner_id: i64,
    username: String,
}

impl TelegramClient {
    /// Connect with `bot_token` and learn the bot's username via `getMe`.
    pub async fn connect(bot_token: &str, owner_id: i64) -> Result<Self> {
        let mut client = Self {
            client: http_client::build_client(Duration::ZERO)?,
            api_base: format!("https://api.telegram.org/bot{bot_token}"),
            owner_id,
            username: String::new(),
        };
        let me = client.get_me().await?;
        client.username = me.username.unwrap_or_default();
        info!(username = %client.username, "Connected to Telegram");
        Ok(client)
    }

    pub async fn get_me(&self) -> Result<User> {
        self.call("getMe", Payload::Json(json!({})), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.get_updates_with_timeout(offset, LONG_POLL_TIMEOUT_SECS)
            .await
    }

    /// `getUpdates` with an explicit server-side wait. Zero returns at once.
    pub async fn get_updates_with_timeout(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let payload = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        self.call(
            "getUpdates",
            Payload::Json(payload),
            Duration::from_secs(timeout_secs + 15),
        )
        .await
    }

    /// Send request with rate limit handling.
    async fn call<T: DeserializeOwned>(&self, method: &str, payload: Payload, timeout: Duration) -> Result<T> {
        let url = format!("{}/{}", self.api_base, method);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let request = payload.apply(self.client.post(&url).timeout(timeout))?;
            let response = request.send().await?;
            let status = response.status();
            let body: ApiResponse<T> = response.json().await?;

            if body.ok {
                return body.result.ok_or_else(|| Error::Telegram {
                    code: None,
                    description: format!("{method} returned no result"),
                });
            }

            let rate_limited = status.as_u16() == 429 || body.error_code == Some(429);
            if rate_limited {
                let retry_after = body
                    .parameters
                    .as_ref()
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs);

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    warn!(
                        method,
                        "Telegram rate limit: max retries ({}) exceeded, last retry_after was {:?}",
                        MAX_RATE_LIMIT_RETRIES,
                        retry_after
                    );
                    return Err(Error::Telegram {
                        code: Some(429),
                        description: format!(
                            "rate limit exceeded after {MAX_RATE_LIMIT_RETRIES} retries"
                        ),
                    });
                }

                let wait_duration = retry_after.unwrap_or(Duration::from_secs(1));
                debug!(
                    method,
                    "Telegram rate limited (429), waiting {:?} before retry (attempt {}/{})",
                    wait_duration,
                    attempts,
                    MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait_duration).await;
                continue;
            }

            let description = body.description.unwrap_or_else(|| status.to_string());
            warn!(method, %status, %description, "Telegram request failed");
            return Err(Error::Telegram {
                code: body.error_code,
                description,
            });
        }
    }
}

async fn upload_for(sticker: &Sticker, field: String) -> Result<(InputSticker, UploadFile)> {
    let bytes = tokio::fs::read(&sticker.path)
        .await
        .map_err(|e| fs::io_error("reading sticker", &sticker.path, e))?;
    let (mime, ext) = match sticker.format {
        StickerFormat::Video => ("video/webm", "webm"),
        StickerFormat::Static => match sticker.path.extension().and_then(|e| e.to_str()) {
            Some("webp") => ("image/webp", "webp"),
            _ => ("image/png", "png"),
        },
    };

    let input = InputSticker {
        sticker: format!("attach://{field}"),
        format: sticker.format.as_str(),
        emoji_list: vec![STICKER_EMOJI.to_string()],
    };
    let file = UploadFile {
        file_name: format!("{}.{ext}", sticker.ordinal),
        field,
        mime,
        bytes,
    };
    Ok((input, file))
}

async fn sticker_uploads(stickers: &[Sticker]) -> Result<(Vec<InputSticker>, Vec<UploadFile>)> {
    let mut inputs = Vec::with_capacity(stickers.len());
    let mut files = Vec::with_capacity(stickers.len());
    for (idx, sticker) in stickers.iter().enumerate() {
        let (input, file) = upload_for(sticker, format!("file{idx}")).await?;
        inputs.push(input);
        files.push(file);
    }
    Ok((inputs, files))
}

#[async_trait]
impl ChatPlatform for TelegramClient {
    fn bot_username(&self) -> &str {
        &self.username
    }

    async fn create_sticker_set(&self, name: &str, title: &str, stickers: &[Sticker]) -> Result<()> {
        let (inputs, files) = sticker_uploads(stickers).await?;
        let payload = Payload::Multipart {
            fields: vec![
                ("user_id", self.owner_id.to_string()),
                ("name", name.to_string()),
                ("title", title.to_string()),
                ("stickers", serde_json::to_string(&inputs)?),
            ],
            files,
        };
        let _: bool = self.call("createNewStickerSet", payload, UPLOAD_TIMEOUT).await?;
        info!(name, count = stickers.len(), "Created sticker set");
        Ok(())
    }

    async fn add_sticker_to_set(&self, name: &str, sticker: &Sticker) -> Result<()> {
        let (input, file) = upload_for(sticker, "file0".to_string()).await?;
        let payload = Payload::Multipart {
            fields: vec![
                ("user_id", self.owner_id.to_string()),
                ("name", name.to_string()),
                ("sticker", serde_json::to_string(&input)?),
            ],
            files: vec![file],
        };
        let _: bool = self.call("addStickerToSet", payload, UPLOAD_TIMEOUT).await?;
        debug!(name, ordinal = sticker.ordinal, "Added sticker to set");
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
        });
        let _: serde_json::Value = self
            .call("sendMessage", Payload::Json(payload), DEFAULT_REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sticker_uploads_reference_attachments() {
        let dir = TempDir::new().unwrap();
        let png = dir.path().join("1.png");
        let webm = dir.path().join("2.webm");
        std::fs::write(&png, b"png").unwrap();
        std::fs::write(&webm, b"webm").unwrap();

        let stickers = vec![
            Sticker {
                ordinal: 1,
                path: png,
                format: StickerFormat::Static,
            },
            Sticker {
                ordinal: 2,
                path: webm,
                format: StickerFormat::Video,
            },
        ];
        let (inputs, files) = sticker_uploads(&stickers).await.unwrap();

        assert_eq!(inputs[0].sticker, "attach://file0");
        assert_eq!(inputs[1].sticker, "attach://file1");
        assert_eq!(inputs[1].format, "video");
        assert_eq!(files[1].mime, "video/webm");
        assert_eq!(files[1].file_name, "2.webm");

        let json = serde_json::to_value(&inputs[0]).unwrap();
        assert_eq!(json["emoji_list"][0], STICKER_EMOJI);
    }

    #[tokio::test]
    async fn test_missing_sticker_file_is_io_error() {
        let sticker = Sticker {
            ordinal: 3,
            path: PathBuf::from("/nonexistent/3.png"),
            format: StickerFormat::Static,
        };
        let err = upload_for(&sticker, "file0".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::IoPath { .. }));
    }

    #[test]
    fn test_multipart_payload_rebuilds() {
        let payload = Payload::Multipart {
            fields: vec![("name", "abc".to_string())],
            files: vec![UploadFile {
                field: "file0".to_string(),
                file_name: "1.png".to_string(),
                mime: "image/png",
                bytes: vec![1, 2, 3],
            }],
        };
        http_client::install_rustls_provider();
        let client = Client::new();
        for _ in 0..2 {
            assert!(payload.apply(client.post("http://localhost/")).is_ok());
        }
    }
}
