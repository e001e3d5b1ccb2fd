//! The `Test::Initial` object: typed proxy and servant.

use async_trait::async_trait;
use orbit::{
    Current, DispatchError, InvocationError, ProxyHandle, Servant, ShutdownError, decode_arg,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

/// Registered type name of the interface.
pub const TYPE_NAME: &str = "Initial";

/// Identity the server registers its servant under.
pub const IDENTITY: &str = "initial";

#[derive(Debug, thiserror::Error)]
pub enum InitialError {
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("'{operation}' returned an unexpected value: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("proxy is for '{0}', not 'Initial'")]
    WrongType(String),
}

/// Typed wrapper over a proxy to an `Initial` object.
#[derive(Debug, Clone)]
pub struct InitialPrx {
    proxy: ProxyHandle,
}

impl InitialPrx {
    pub fn new(proxy: ProxyHandle) -> Result<Self, InitialError> {
        if proxy.type_name() != TYPE_NAME {
            return Err(InitialError::WrongType(proxy.type_name().to_string()));
        }
        Ok(Self { proxy })
    }

    pub fn proxy(&self) -> &ProxyHandle {
        &self.proxy
    }

    pub async fn ping(&self) -> Result<(), InitialError> {
        Ok(self.proxy.ping().await?)
    }

    pub async fn ice_id(&self) -> Result<String, InitialError> {
        Ok(self.proxy.ice_id().await?)
    }

    pub async fn get_name(&self) -> Result<String, InitialError> {
        self.call("getName", Vec::new()).await
    }

    pub async fn echo(&self, message: &str) -> Result<String, InitialError> {
        self.call("echo", vec![json!(message)]).await
    }

    pub async fn add(&self, a: i32, b: i32) -> Result<i32, InitialError> {
        self.call("add", vec![json!(a), json!(b)]).await
    }

    pub async fn split(&self, text: &str) -> Result<Vec<String>, InitialError> {
        self.call("split", vec![json!(text)]).await
    }

    /// Ask the server's context to shut down and wait for its acknowledgement.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.proxy.shutdown().await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        args: Vec<Value>,
    ) -> Result<T, InitialError> {
        let value = self.proxy.invoke(operation, args).await?;
        serde_json::from_value(value).map_err(|source| InitialError::Decode { operation, source })
    }
}

/// Server-side implementation of `Initial`.
pub struct InitialI {
    name: String,
}

impl InitialI {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Servant for InitialI {
    async fn dispatch(&self, current: &Current, args: Vec<Value>) -> Result<Value, DispatchError> {
        match current.operation.as_str() {
            "getName" => Ok(json!(self.name)),
            "echo" => {
                let message: String = decode_arg(&args, 0)?;
                Ok(json!(message))
            }
            "add" => {
                let a: i32 = decode_arg(&args, 0)?;
                let b: i32 = decode_arg(&args, 1)?;
                let sum = a
                    .checked_add(b)
                    .ok_or_else(|| DispatchError::failed(format!("{a} + {b} overflows")))?;
                Ok(json!(sum))
            }
            "split" => {
                let text: String = decode_arg(&args, 0)?;
                Ok(json!(text.split_whitespace().collect::<Vec<_>>()))
            }
            "shutdown" => {
                tracing::info!(identity = %current.identity, "Shutdown requested by client");
                current.control().begin_shutdown();
                Ok(Value::Null)
            }
            other => Err(DispatchError::OperationNotExist(other.to_string())),
        }
    }
}
