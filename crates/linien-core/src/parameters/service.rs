//! JSON-RPC surface of the parameter store.
//!
//! | method                         | params                     | result            |
//! |--------------------------------|----------------------------|-------------------|
//! | `init_parameter_sync`          | `session`                  | `[ParameterSnapshot]` |
//! | `get_param`                    | `name`                     | value             |
//! | `set_param`                    | `name`, `value`            | `null`            |
//! | `reset_param`                  | `name`                     | `null`            |
//! | `get_changed_parameters_queue` | `session`                  | `[ParameterChange]` |
//! | `register_remote_listeners`    | `session`, `names`         | `null`            |

use std::sync::Arc;

use serde_json::{json, Value};

use super::store::ParameterStore;
use super::types::SessionId;
use crate::error::{LinienError, Result};
use crate::ipc::IpcDispatch;

pub const METHOD_INIT_PARAMETER_SYNC: &str = "init_parameter_sync";
pub const METHOD_GET_PARAM: &str = "get_param";
pub const METHOD_SET_PARAM: &str = "set_param";
pub const METHOD_RESET_PARAM: &str = "reset_param";
pub const METHOD_GET_CHANGED_PARAMETERS_QUEUE: &str = "get_changed_parameters_queue";
pub const METHOD_REGISTER_REMOTE_LISTENERS: &str = "register_remote_listeners";

/// Dispatches parameter RPCs to a shared [`ParameterStore`].
#[derive(Debug, Clone)]
pub struct ParameterService {
    store: Arc<ParameterStore>,
}

impl ParameterService {
    pub fn new(store: Arc<ParameterStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ParameterStore> {
        &self.store
    }
}

#[async_trait::async_trait]
impl IpcDispatch for ParameterService {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            METHOD_INIT_PARAMETER_SYNC => {
                let session = require_session(&params)?;
                Ok(serde_json::to_value(self.store.init_parameter_sync(session))?)
            }
            METHOD_GET_PARAM => {
                let name = require_str(&params, "name")?;
                self.store.get(name)
            }
            METHOD_SET_PARAM => {
                let name = require_str(&params, "name")?;
                let value = params
                    .get("value")
                    .cloned()
                    .ok_or_else(|| missing("value"))?;
                self.store.set(name, value)?;
                Ok(Value::Null)
            }
            METHOD_RESET_PARAM => {
                let name = require_str(&params, "name")?;
                self.store.reset(name)?;
                Ok(Value::Null)
            }
            METHOD_GET_CHANGED_PARAMETERS_QUEUE => {
                let session = require_session(&params)?;
                Ok(serde_json::to_value(self.store.take_changes(session)?)?)
            }
            METHOD_REGISTER_REMOTE_LISTENERS => {
                let session = require_session(&params)?;
                let names: Vec<String> = params
                    .get("names")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .ok_or_else(|| missing("names"))?;
                self.store.register_listeners(session, &names)?;
                Ok(json!(null))
            }
            _ => Err(LinienError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }
}

fn missing(field: &str) -> LinienError {
    LinienError::InvalidParams {
        message: format!("Missing required parameter: {}", field),
    }
}

fn require_str<'a>(params: &'a Value, field: &str) -> Result<&'a str> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| missing(field))
}

fn require_session(params: &Value) -> Result<SessionId> {
    require_str(params, "session")?
        .parse()
        .map_err(|e| LinienError::InvalidParams {
            message: format!("Invalid session id: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::types::{ParameterAttributes, ParameterChange, ParameterSnapshot};

    fn service() -> ParameterService {
        let store = ParameterStore::builder()
            .declare("speed", json!(10), ParameterAttributes::new().cacheable(true))
            .declare("status", json!("idle"), ParameterAttributes::new())
            .build()
            .unwrap();
        ParameterService::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_sync_then_fetch_changes() {
        let service = service();
        let session = SessionId::new();

        let inventory = service
            .dispatch(METHOD_INIT_PARAMETER_SYNC, json!({"session": session}))
            .await
            .unwrap();
        let inventory: Vec<ParameterSnapshot> = serde_json::from_value(inventory).unwrap();
        assert_eq!(inventory.len(), 2);

        service
            .dispatch(METHOD_SET_PARAM, json!({"name": "speed", "value": 20}))
            .await
            .unwrap();

        let changes = service
            .dispatch(METHOD_GET_CHANGED_PARAMETERS_QUEUE, json!({"session": session}))
            .await
            .unwrap();
        let changes: Vec<ParameterChange> = serde_json::from_value(changes).unwrap();
        assert_eq!(changes, vec![ParameterChange::new("speed", json!(20))]);
    }

    #[tokio::test]
    async fn test_register_then_receive_non_cacheable() {
        let service = service();
        let session = SessionId::new();
        service
            .dispatch(METHOD_INIT_PARAMETER_SYNC, json!({"session": session}))
            .await
            .unwrap();

        service
            .dispatch(
                METHOD_REGISTER_REMOTE_LISTENERS,
                json!({"session": session, "names": ["status"]}),
            )
            .await
            .unwrap();
        service
            .dispatch(METHOD_SET_PARAM, json!({"name": "status", "value": "locked"}))
            .await
            .unwrap();

        let value = service
            .dispatch(METHOD_GET_PARAM, json!({"name": "status"}))
            .await
            .unwrap();
        assert_eq!(value, json!("locked"));

        let changes = service
            .dispatch(METHOD_GET_CHANGED_PARAMETERS_QUEUE, json!({"session": session}))
            .await
            .unwrap();
        assert_eq!(changes, json!([{"name": "status", "value": "locked"}]));
    }

    #[tokio::test]
    async fn test_missing_and_malformed_params() {
        let service = service();

        let err = service.dispatch(METHOD_GET_PARAM, json!({})).await.unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32602);

        let err = service
            .dispatch(METHOD_GET_CHANGED_PARAMETERS_QUEUE, json!({"session": "not-a-uuid"}))
            .await
            .unwrap_err();
        assert!(matches!(err, LinienError::InvalidParams { .. }));

        let err = service
            .dispatch(METHOD_SET_PARAM, json!({"name": "speed"}))
            .await
            .unwrap_err();
        assert!(matches!(err, LinienError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let err = service().dispatch("exposed_nope", json!({})).await.unwrap_err();
        assert!(matches!(err, LinienError::MethodNotFound { .. }));
    }
}
