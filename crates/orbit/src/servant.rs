//! Local object implementations behind an adapter identity.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::protocol::{ReplyOutcome, RequestId};
use crate::context::ContextControl;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("operation '{0}' is not implemented")]
    OperationNotExist(String),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("{0}")]
    Failed(String),
}

impl DispatchError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub(crate) fn into_outcome(self) -> ReplyOutcome {
        match self {
            Self::OperationNotExist(operation) => ReplyOutcome::OperationNotExist { operation },
            Self::BadArguments(reason) => ReplyOutcome::BadArguments { reason },
            Self::Failed(message) => ReplyOutcome::ServantError { message },
        }
    }
}

/// Information about the request being dispatched.
#[derive(Clone)]
pub struct Current {
    pub adapter: String,
    pub identity: String,
    pub operation: String,
    pub request_id: RequestId,
    control: ContextControl,
}

impl Current {
    pub(crate) fn new(
        adapter: &str,
        identity: &str,
        operation: &str,
        request_id: RequestId,
        control: ContextControl,
    ) -> Self {
        Self {
            adapter: adapter.to_string(),
            identity: identity.to_string(),
            operation: operation.to_string(),
            request_id,
            control,
        }
    }

    /// Control surface of the context that owns the adapter.
    pub fn control(&self) -> &ContextControl {
        &self.control
    }
}

/// A local object that answers requests.
///
/// Argument count is checked against the registered descriptor before
/// `dispatch` is called; argument types are the servant's to check.
#[async_trait]
pub trait Servant: Send + Sync + 'static {
    async fn dispatch(&self, current: &Current, args: Vec<Value>) -> Result<Value, DispatchError>;
}

/// Decode positional argument `index`.
pub fn decode_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, DispatchError> {
    let raw = args
        .get(index)
        .ok_or_else(|| DispatchError::BadArguments(format!("missing argument {index}")))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| DispatchError::BadArguments(format!("argument {index}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_arg_checks_presence_and_type() {
        let args = vec![json!("hello"), json!(3)];
        assert_eq!(decode_arg::<String>(&args, 0).unwrap(), "hello");
        assert_eq!(decode_arg::<i32>(&args, 1).unwrap(), 3);
        assert!(matches!(
            decode_arg::<i32>(&args, 0),
            Err(DispatchError::BadArguments(_))
        ));
        assert!(matches!(
            decode_arg::<String>(&args, 2),
            Err(DispatchError::BadArguments(_))
        ));
    }

    #[test]
    fn dispatch_errors_map_to_outcomes() {
        assert_eq!(
            DispatchError::failed("boom").into_outcome(),
            ReplyOutcome::ServantError {
                message: "boom".to_string()
            }
        );
        assert_eq!(
            DispatchError::OperationNotExist("x".into()).into_outcome(),
            ReplyOutcome::OperationNotExist {
                operation: "x".to_string()
            }
        );
    }
}
