//! Tipos do envelope JSON-RPC trocado com o workcell e a decodificação das
//! respostas.
//!
//! O workcell pode responder com um único objeto JSON ou com um feed de
//! eventos (`text/event-stream`) em que o payload vem numa linha `data:`.
//! [`decode_envelope`] aceita os dois formatos e falha fechado com
//! [`WorkcellError::Protocol`] quando nenhum deles casa.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::WorkcellError;

/// Prefixo da linha de payload num feed de eventos.
const EVENT_DATA_PREFIX: &str = "data:";

/// Corpo de uma requisição JSON-RPC 2.0.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    /// Ausente em notificações.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> RpcRequest<'a> {
    pub fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params: Some(params),
        }
    }

    pub fn notification(method: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        }
    }
}

/// Objeto de erro do JSON-RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Resposta JSON-RPC: exatamente um entre `result` e `error` vem preenchido.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

/// Um bloco de conteúdo do resultado de uma ferramenta.
///
/// O campo `content_type` é serializado como `"type"` no JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Resultado de `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default, rename = "isError")]
    pub is_error: bool,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "structuredContent")]
    pub structured_content: Option<Value>,
}

// Uma mensagem JSON é uma resposta se carrega `result` ou `error`;
// notificações de progresso no mesmo feed são ignoradas.
fn is_response(value: &Value) -> bool {
    value.get("result").is_some() || value.get("error").is_some()
}

fn pick_response(value: Value) -> Option<Value> {
    match value {
        Value::Object(_) if is_response(&value) => Some(value),
        Value::Array(items) => items.into_iter().find(is_response),
        _ => None,
    }
}

/// Extrai a resposta JSON-RPC de um corpo HTTP, seja objeto único, lote ou
/// feed de eventos.
pub fn decode_envelope(operation: &str, body: &str) -> Result<RpcResponse, WorkcellError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(WorkcellError::protocol(operation, "empty response body", body));
    }

    let found = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => pick_response(value),
        Err(_) => body
            .lines()
            .filter_map(|line| line.strip_prefix(EVENT_DATA_PREFIX))
            .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
            .find_map(pick_response),
    };

    let Some(value) = found else {
        return Err(WorkcellError::protocol(
            operation,
            "no JSON-RPC response object in body",
            body,
        ));
    };

    serde_json::from_value(value)
        .map_err(|e| WorkcellError::protocol(operation, format!("malformed envelope: {e}"), body))
}

// Um `result` nulo ou um objeto vazio contam como ausência de conteúdo
// estruturado; a decodificação segue para o texto.
fn usable_structured(structured: Option<Value>) -> Option<Value> {
    let value = match structured? {
        Value::Object(mut map) if map.contains_key("result") => map.remove("result")?,
        other => other,
    };
    match &value {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        _ => Some(value),
    }
}

/// Interpreta o resultado de uma chamada de ferramenta.
///
/// `structuredContent` é autoritativo quando presente; caso contrário o texto
/// do primeiro bloco é decodificado como JSON e, em último caso, devolvido
/// como texto cru. Resposta sem conteúdo é erro de protocolo.
pub fn decode_tool_result(operation: &str, body: &str) -> Result<Value, WorkcellError> {
    let envelope = decode_envelope(operation, body)?;

    if let Some(error) = envelope.error {
        return Err(WorkcellError::Remote {
            operation: operation.to_string(),
            message: format!("{} (code {})", error.message, error.code),
            payload: body.to_string(),
        });
    }

    let raw = envelope
        .result
        .ok_or_else(|| WorkcellError::protocol(operation, "response has no result", body))?;
    let result: ToolCallResult = serde_json::from_value(raw)
        .map_err(|e| WorkcellError::protocol(operation, format!("malformed tool result: {e}"), body))?;

    let first_text = result
        .content
        .iter()
        .find_map(|block| block.text.as_deref())
        .filter(|text| !text.trim().is_empty());

    if result.is_error {
        return Err(WorkcellError::Remote {
            operation: operation.to_string(),
            message: first_text.unwrap_or("tool reported an error").to_string(),
            payload: body.to_string(),
        });
    }

    if let Some(structured) = usable_structured(result.structured_content) {
        return Ok(structured);
    }

    match first_text {
        Some(text) => Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))),
        None => Err(WorkcellError::protocol(
            operation,
            "tool result carried no content",
            body,
        )),
    }
}
