//! Chat application handlers
//!
//! `/app/chat` relays the body verbatim to `/topic/messages`.
//! `/app/sendMessage/{roomId}` stamps the message and publishes it to
//! `/topic/room/{roomId}`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_broker::{HandlerContext, HandlerError, HandlerRegistry, MessageHandler, Reply};
use serde::{Deserialize, Serialize};

/// Incoming room message
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub room_id: Option<String>,
}

/// Message as published to the room topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub sender: String,
    pub content: String,
    pub room_id: String,
    pub time_stamp: DateTime<Utc>,
}

/// Passes the body through untouched
#[derive(Debug, Default)]
pub struct ChatRelay;

#[async_trait]
impl MessageHandler for ChatRelay {
    async fn handle(&self, ctx: HandlerContext, body: Vec<u8>) -> Result<Option<Reply>, HandlerError> {
        let content_type = ctx.header("content-type").map(str::to_string);
        Ok(Some(Reply::new(body, content_type)))
    }
}

#[derive(Debug, Default)]
pub struct RoomMessages;

#[async_trait]
impl MessageHandler for RoomMessages {
    async fn handle(&self, ctx: HandlerContext, body: Vec<u8>) -> Result<Option<Reply>, HandlerError> {
        let room_id = ctx
            .var("roomId")
            .ok_or_else(|| HandlerError::BadRequest("missing room id".to_string()))?;
        let request: MessageRequest = serde_json::from_slice(&body)?;

        if let Some(claimed) = request.room_id.as_deref() {
            if claimed != room_id {
                tracing::debug!(room_id, claimed, "Room id in body differs from destination");
            }
        }

        let message = RoomMessage {
            sender: request.sender,
            content: request.content,
            room_id: room_id.to_string(),
            time_stamp: Utc::now(),
        };
        Reply::json(&message).map(Some)
    }
}

/// Handler table of the chat application
pub fn handlers() -> Result<HandlerRegistry, HandlerError> {
    HandlerRegistry::new()
        .route("/chat", Some("/topic/messages"), ChatRelay)?
        .route("/sendMessage/{roomId}", Some("/topic/room/{roomId}"), RoomMessages)
}
