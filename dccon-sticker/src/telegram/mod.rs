//! Chat-platform collaborator: the Telegram Bot API.

mod client;
pub mod types;

pub use client::TelegramClient;

use async_trait::async_trait;

use crate::Result;
use crate::domain::Sticker;

/// Emoji attached to every registered sticker.
pub const STICKER_EMOJI: &str = "\u{1f338}";

/// What the rest of the crate needs from the chat platform.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Username of the bot account. Sticker set names must end in
    /// `_by_<username>`.
    fn bot_username(&self) -> &str;

    async fn create_sticker_set(&self, name: &str, title: &str, stickers: &[Sticker]) -> Result<()>;

    async fn add_sticker_to_set(&self, name: &str, sticker: &Sticker) -> Result<()>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Public link of a sticker set.
pub fn sticker_set_link(name: &str) -> String {
    format!("https://t.me/addstickers/{name}")
}
