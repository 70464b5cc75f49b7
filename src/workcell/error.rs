//! Tipos de erro para o cliente do workcell.
//!
//! Define [`WorkcellError`] separando falhas de transporte (rede, timeout,
//! HTTP 5xx) de falhas de protocolo e de erros reportados pelo próprio
//! workcell. Nenhuma variante trunca o payload recebido.

use std::time::Duration;

use thiserror::Error;

/// Erros que podem ocorrer ao conversar com o workcell remoto.
#[derive(Debug, Clone, Error)]
pub enum WorkcellError {
    /// Falha de rede subjacente (DNS, conexão recusada, conexão derrubada).
    #[error("connection error during {operation}: {message}")]
    Connection { operation: String, message: String },

    /// A chamada não terminou dentro do prazo configurado.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// O servidor respondeu com um status HTTP fora da faixa 2xx.
    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    /// O workcell executou a chamada e reportou falha explicitamente.
    #[error("workcell reported an error for {operation}: {message}")]
    Remote {
        operation: String,
        message: String,
        payload: String,
    },

    /// A resposta não pôde ser decodificada no formato esperado.
    #[error("could not decode response to {operation}: {reason}; payload: {payload}")]
    Protocol {
        operation: String,
        reason: String,
        payload: String,
    },
}

impl WorkcellError {
    /// Falhas de transporte podem ser retentadas em operações idempotentes.
    pub fn is_transport(&self) -> bool {
        match self {
            WorkcellError::Connection { .. } | WorkcellError::Timeout { .. } => true,
            WorkcellError::Status { status, .. } => Self::is_transient_status(*status),
            WorkcellError::Remote { .. } | WorkcellError::Protocol { .. } => false,
        }
    }

    /// Server errors and rate limiting; other non-2xx codes are refusals.
    pub fn is_transient_status(status: u16) -> bool {
        status >= 500 || status == 429
    }

    pub(crate) fn protocol(
        operation: &str,
        reason: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        WorkcellError::Protocol {
            operation: operation.to_string(),
            reason: reason.into(),
            payload: payload.into(),
        }
    }

    /// Classifica um erro do `reqwest` como timeout ou falha de conexão.
    pub(crate) fn from_transport(operation: &str, after: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WorkcellError::Timeout {
                operation: operation.to_string(),
                after,
            }
        } else {
            WorkcellError::Connection {
                operation: operation.to_string(),
                message: err.to_string(),
            }
        }
    }
}
