// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! WebSocket upstream transport: one JSON-RPC object per frame, on the
//! `/ws` route. Mirrors `presentation::stdio`'s per-session sequential
//! processing — one task per connection, requests handled in arrival order.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::debug;

use crate::application::router_service::RouterService;
use crate::domain::jsonrpc::JsonRpcRequest;
use crate::presentation::rpc_dispatch::dispatch;

pub async fn upgrade(
    State(router): State<Arc<RouterService>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(router, socket))
}

async fn handle_socket(router: Arc<RouterService>, mut socket: WebSocket) {
    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => break,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };

        let request: JsonRpcRequest = match serde_json::from_str(text.as_str()) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "skipping non-JSON-RPC websocket frame");
                continue;
            }
        };

        if let Some(response) = dispatch(&router, request).await {
            let Ok(encoded) = serde_json::to_string(&response) else {
                continue;
            };
            if socket.send(Message::Text(encoded.into())).await.is_err() {
                break;
            }
        }
    }
}
