//! Adapts an axum WebSocket to the relay's [`Frame`] transport.
//!
//! Data frames travel as binary or text messages depending on the channel.
//! Text payloads are relayed byte-for-byte; the relay never re-encodes them.
//! Text channels only ever carry valid UTF-8: binary messages that are not
//! UTF-8 are dropped on the way in.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::future::ready;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

use crate::channel::{Channel, WireFormat};
use crate::error::{CollabError, Result};
use crate::hub::{ClientIdentity, Frame, Hub};

fn to_message(frame: Frame, wire: WireFormat) -> Message {
    match frame {
        Frame::Data(payload) => match wire {
            WireFormat::Binary => Message::Binary(payload.to_vec()),
            WireFormat::Text => Message::Text(String::from_utf8_lossy(&payload).into_owned()),
        },
        Frame::Ping => Message::Ping(Vec::new()),
        Frame::Pong => Message::Pong(Vec::new()),
    }
}

fn from_message(
    message: std::result::Result<Message, axum::Error>,
    wire: WireFormat,
) -> Option<Result<Frame>> {
    match message {
        Ok(Message::Binary(data)) if wire == WireFormat::Text && std::str::from_utf8(&data).is_err() => {
            warn!(len = data.len(), "Dropped non UTF-8 frame on a text channel");
            None
        }
        Ok(Message::Binary(data)) => Some(Ok(Frame::Data(Bytes::from(data)))),
        Ok(Message::Text(text)) => Some(Ok(Frame::Data(Bytes::from(text.into_bytes())))),
        Ok(Message::Ping(_)) => Some(Ok(Frame::Ping)),
        Ok(Message::Pong(_)) => Some(Ok(Frame::Pong)),
        Ok(Message::Close(_)) => None,
        Err(e) => Some(Err(CollabError::Transport(e.to_string()))),
    }
}

/// Run one admitted connection to completion.
pub async fn serve_socket(
    socket: WebSocket,
    hub: Arc<Hub>,
    channel: Channel,
    doc_id: String,
    identity: ClientIdentity,
) {
    let wire = channel.wire();
    let actor = hub.connect(channel, &doc_id, identity);
    let client_id = actor.id();
    info!(
        doc_id = %doc_id,
        client_id = %client_id,
        channel = channel.name(),
        "WebSocket connection established"
    );

    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| CollabError::Transport(e.to_string()))
        .with(move |frame: Frame| ready(Ok::<_, CollabError>(to_message(frame, wire))));
    let inbound = Box::pin(
        stream
            .take_while(|message| ready(!matches!(message, Ok(Message::Close(_)))))
            .filter_map(move |message| ready(from_message(message, wire))),
    );

    actor.run(inbound, sink).await;
}
