//! JSON-RPC 2.0 envelope for the deskmated stdio server.

use crate::category::Category;
use crate::request::DeviceInfo;
use serde::{Deserialize, Serialize};

/// Methods supported by deskmated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RpcMethod {
    Chat,
    Feedback,
    Analyze,
    Search,
    Session,
    ClearSession,
    Status,
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: RpcMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: String,
}

impl RpcRequest {
    pub fn new(method: RpcMethod, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method,
            params,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: String,
}

impl RpcResponse {
    pub fn success(id: String, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: String, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Parameters for the analyze method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeParams {
    pub problem_description: String,
    #[serde(default)]
    pub device_info: Option<DeviceInfo>,
}

/// Parameters for the search method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default)]
    pub problem_category: Option<Category>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    10
}

/// Parameters for session lookups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_snake_case_method() {
        let req: RpcRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"clear_session","params":{"session_id":"a"},"id":"1"}"#,
        )
        .unwrap();
        assert_eq!(req.method, RpcMethod::ClearSession);
    }

    #[test]
    fn test_error_response_omits_result() {
        let resp = RpcResponse::error("1".into(), -32602, "bad".into());
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32602);
    }

    #[test]
    fn test_search_limit_default() {
        let params: SearchParams = serde_json::from_str(r#"{"query":"wifi"}"#).unwrap();
        assert_eq!(params.limit, 10);
        assert!(params.problem_category.is_none());
    }
}
