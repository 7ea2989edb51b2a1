use serde::Serialize;
use serde_json::{json, Value};

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

pub fn ok(id: &str, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let error = ErrorBody {
        code,
        message: message.into(),
        details,
    };
    json!({ "id": id, "ok": false, "error": error })
}

/// Reply to a line that did not parse as a request; there is no id to echo.
pub fn unparsable(e: &serde_json::Error) -> Value {
    let error = ErrorBody {
        code: "bad_json",
        message: e.to_string(),
        details: Some(json!({ "line": e.line(), "column": e.column() })),
    };
    json!({ "id": null, "ok": false, "error": error })
}
