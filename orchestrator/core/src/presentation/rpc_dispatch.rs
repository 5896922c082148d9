// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Shared Tool Protocol method dispatch. Both `presentation::stdio` and
//! `presentation::ws` are thin framing adapters over [`dispatch`] so the two
//! transports can't drift on request handling.

use std::sync::Arc;

use serde_json::Value;

use crate::application::router_service::RouterService;
use crate::domain::errors::{ClassifiedError, RouterError};
use crate::domain::jsonrpc::{error_codes, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolsCallParams};

/// Dispatches one request against `router`. Returns `None` for notifications
/// — `notifications/initialized` carries no id and is fire-and-forget; every
/// other method always answers, success or error.
pub async fn dispatch(router: &Arc<RouterService>, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    if request.is_notification() {
        return None;
    }
    let id = request.id.clone().unwrap_or(Value::Null);

    let result: Result<Value, JsonRpcError> = match request.method.as_str() {
        "initialize" => Ok(serde_json::to_value(router.initialize()).unwrap_or(Value::Null)),
        "tools/list" => router
            .tools_list()
            .await
            .map(|tools| serde_json::json!({ "tools": tools }))
            .map_err(|e| router_error(&e)),
        "tools/call" => call_tool(router, request.params).await,
        other => Err(JsonRpcError {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("unknown method: {other}"),
            data: None,
        }),
    };

    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(error) => JsonRpcResponse::failure(id, error),
    })
}

async fn call_tool(router: &Arc<RouterService>, params: Option<Value>) -> Result<Value, JsonRpcError> {
    let params = params.ok_or_else(|| JsonRpcError {
        code: error_codes::INVALID_PARAMS,
        message: "tools/call requires params".to_string(),
        data: None,
    })?;
    let params: ToolsCallParams = serde_json::from_value(params).map_err(|e| JsonRpcError {
        code: error_codes::INVALID_PARAMS,
        message: e.to_string(),
        data: None,
    })?;

    router
        .call_tool(&params.name, params.arguments)
        .await
        .map(|(value, _bytes)| value)
        .map_err(|e| router_error(&e))
}

fn router_error(err: &RouterError) -> JsonRpcError {
    let classified: ClassifiedError = err.into();
    JsonRpcError {
        code: error_codes::INTERNAL_ERROR,
        message: err.to_string(),
        data: serde_json::to_value(&classified).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::jsonrpc::error_codes;
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
    async fn notifications_get_no_response() {
        let router = test_router().await;
        let request = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(dispatch(&router, request).await.is_none());
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let router = test_router().await;
        let request = JsonRpcRequest::call(serde_json::json!(1), "initialize", serde_json::json!({}));
        let response = dispatch(&router, request).await.unwrap();
        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "fleetmux");
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let router = test_router().await;
        let request = JsonRpcRequest::call(serde_json::json!(1), "bogus/method", serde_json::json!({}));
        let response = dispatch(&router, request).await.unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn tools_call_without_params_is_invalid_params() {
        let router = test_router().await;
        let mut request = JsonRpcRequest::call(serde_json::json!(1), "tools/call", serde_json::json!({}));
        request.params = None;
        let response = dispatch(&router, request).await.unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_PARAMS);
    }
}
