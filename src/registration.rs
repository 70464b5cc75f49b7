//! Job-definition registration on the workcell.
//!
//! Registration is not idempotent on the workcell side, so callers check with
//! [`find_definition`] before calling [`register_definition`].

use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::workcell::{ToolInvoker, WorkcellError};

const UPLOAD_TOOL: &str = "create_workflow_definition_file";
const REGISTER_TOOL: &str = "register_workflow_definition";
const LIST_TOOL: &str = "list_workflow_definitions";

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("definition '{name}' not found after registration")]
    NotFound { name: String },

    #[error(transparent)]
    Workcell(#[from] WorkcellError),
}

/// Looks up a registered definition id by name.
pub async fn find_definition<C: ToolInvoker>(
    client: &C,
    name: &str,
    timeout: Duration,
) -> Result<Option<i64>, RegistrationError> {
    let listing = client.invoke_read(LIST_TOOL, json!({}), timeout).await?;
    let Value::Array(definitions) = &listing else {
        return Err(WorkcellError::protocol(
            LIST_TOOL,
            "expected a list of definitions",
            listing.to_string(),
        )
        .into());
    };

    Ok(definitions
        .iter()
        .find(|d| d.get("name").and_then(Value::as_str) == Some(name))
        .and_then(|d| d.get("id"))
        .and_then(Value::as_i64))
}

/// Uploads `code` as `file_name`, registers it under `name` and returns the
/// new definition id.
pub async fn register_definition<C: ToolInvoker>(
    client: &C,
    name: &str,
    file_name: &str,
    code: &str,
    timeout: Duration,
) -> Result<i64, RegistrationError> {
    client
        .invoke(
            UPLOAD_TOOL,
            json!({"file_name": file_name, "code_content": code}),
            timeout,
        )
        .await?;
    client
        .invoke(
            REGISTER_TOOL,
            json!({"name": name, "file_name": file_name}),
            timeout,
        )
        .await?;

    let id = find_definition(client, name, timeout)
        .await?
        .ok_or_else(|| RegistrationError::NotFound {
            name: name.to_string(),
        })?;
    info!(definition = name, id, "registered job definition");
    Ok(id)
}
