// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Stdio upstream transport: newline-delimited JSON in, newline-delimited
//! JSON out. One task owns the whole session and processes requests
//! sequentially, so two calls from the same upstream client can never race
//! each other into the router out of order.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::router_service::RouterService;
use crate::domain::jsonrpc::JsonRpcRequest;
use crate::presentation::rpc_dispatch::dispatch;

/// Runs the stdio session loop over `reader`/`writer` until EOF or `cancel`
/// fires. A line that isn't valid JSON-RPC is logged and skipped rather than
/// ending the session — a malformed line from a misbehaving client shouldn't
/// take down the whole upstream connection.
pub async fn run_stdio_session<R, W>(
    router: Arc<RouterService>,
    reader: R,
    mut writer: W,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "stdio session read failed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "skipping non-JSON-RPC stdio line");
                continue;
            }
        };

        if let Some(response) = dispatch(&router, request).await {
            let Ok(mut encoded) = serde_json::to_string(&response) else {
                continue;
            };
            encoded.push('\n');
            if writer.write_all(encoded.as_bytes()).await.is_err() {
                break;
            }
            let _ = writer.flush().await;
        }
    }
}

/// Entry point used by the CLI's `--transport stdio` mode: binds to the
/// process's actual stdin/stdout.
pub async fn run(router: Arc<RouterService>, cancel: CancellationToken) {
    run_stdio_session(router, tokio::io::stdin(), tokio::io::stdout(), cancel).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cache::{TtlLruCache, TOOLS_CACHE_CAPACITY};
    use crate::infrastructure::config_store::ConfigStore;
    use crate::infrastructure::discovery::DiscoveryEngine;
    use crate::infrastructure::process_supervisor::ProcessSupervisor;
    use crate::infrastructure::usage_tracker::UsageTracker;

    async fn test_router() -> Arc<RouterService> {
        let dir = tempfile::tempdir().unwrap();
        let config_store = ConfigStore::open(dir.path()).await.unwrap();
        let supervisor = ProcessSupervisor::new();
        let tools_cache = Arc::new(TtlLruCache::new(TOOLS_CACHE_CAPACITY).unwrap());
        let discovery = Arc::new(DiscoveryEngine::new(config_store.clone(), supervisor.clone(), tools_cache));
        let tracker = UsageTracker::new(dir.path());
        RouterService::new(config_store, supervisor, discovery, tracker)
    }

    #[tokio::test]
    async fn initialize_request_round_trips_over_the_stream() {
        let router = test_router().await;
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n".to_vec();
        let mut output = Vec::new();
        run_stdio_session(router, input.as_slice(), &mut output, CancellationToken::new()).await;

        let text = String::from_utf8(output).unwrap();
        let response: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(response["result"]["serverInfo"]["name"], "fleetmux");
    }

    #[tokio::test]
    async fn malformed_line_is_skipped_not_fatal() {
        let router = test_router().await;
        let input = b"not json\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"initialize\",\"params\":{}}\n".to_vec();
        let mut output = Vec::new();
        run_stdio_session(router, input.as_slice(), &mut output, CancellationToken::new()).await;

        let text = String::from_utf8(output).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
