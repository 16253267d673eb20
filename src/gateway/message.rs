//! 回复载荷

use serde::{Deserialize, Serialize};

use crate::core::ChatTurn;

/// 推送给所有连接、并同步返回给 HTTP 调用方的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResult {
    pub id: String,
    pub request: ChatTurn,
    pub response: String,
    pub error_code: i32,
}

impl ChatResult {
    pub fn new(
        id: impl Into<String>,
        request: ChatTurn,
        response: impl Into<String>,
        error_code: i32,
    ) -> Self {
        Self {
            id: id.into(),
            request,
            response: response.into(),
            error_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_keys_are_camel_case() {
        let result = ChatResult::new("42", ChatTurn::default(), "hi", 0);
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["id"], "42");
        assert_eq!(v["errorCode"], 0);
        assert_eq!(v["request"]["displayName"], "マスター");
    }
}
