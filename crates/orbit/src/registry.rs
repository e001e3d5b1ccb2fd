//! Interface descriptors and the registry that holds them.
//!
//! Descriptors come from the interface-definition compiler at run time. The
//! registry is filled once, in a burst, and then shared read-only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A parameter or return type as written in the interface definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum TypeRef {
    Void,
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Sequence(Box<TypeRef>),
    /// Proxy to another interface (`Initial*`).
    Proxy(String),
    /// A named alias such as a declared `sequence<T> Name;`.
    Named(String),
}

impl TypeRef {
    pub fn from_builtin(name: &str) -> Option<Self> {
        match name {
            "void" => Some(Self::Void),
            "bool" => Some(Self::Bool),
            "byte" => Some(Self::Byte),
            "short" => Some(Self::Short),
            "int" => Some(Self::Int),
            "long" => Some(Self::Long),
            "float" => Some(Self::Float),
            "double" => Some(Self::Double),
            "string" => Some(Self::String),
            _ => None,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Bool => f.write_str("bool"),
            Self::Byte => f.write_str("byte"),
            Self::Short => f.write_str("short"),
            Self::Int => f.write_str("int"),
            Self::Long => f.write_str("long"),
            Self::Float => f.write_str("float"),
            Self::Double => f.write_str("double"),
            Self::String => f.write_str("string"),
            Self::Sequence(inner) => write!(f, "sequence<{inner}>"),
            Self::Proxy(name) => write!(f, "{name}*"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSignature {
    pub name: String,
    pub params: Vec<Parameter>,
    pub returns: TypeRef,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub idempotent: bool,
}

impl OperationSignature {
    pub fn new(name: impl Into<String>, returns: TypeRef) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns,
            idempotent: false,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Same name, parameter types, return type and mode. Parameter names are ignored.
    fn same_shape(&self, other: &Self) -> bool {
        self.name == other.name
            && self.returns == other.returns
            && self.idempotent == other.idempotent
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.ty == b.ty)
    }
}

/// Structural description of one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Operations in declaration order, inherited ones first.
    pub operations: Vec<OperationSignature>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: None,
            operations: Vec::new(),
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_operation(mut self, operation: OperationSignature) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn operation(&self, name: &str) -> Option<&OperationSignature> {
        self.operations.iter().find(|op| op.name == name)
    }

    /// `Module::Name`, or just the name outside any module.
    pub fn scoped_name(&self) -> String {
        match &self.module {
            Some(module) => format!("{module}::{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Structural equality used for idempotent re-registration.
    pub fn structurally_matches(&self, other: &Self) -> bool {
        self.name == other.name
            && self.module == other.module
            && self.operations.len() == other.operations.len()
            && self
                .operations
                .iter()
                .zip(&other.operations)
                .all(|(a, b)| a.same_shape(b))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("type '{0}' is already registered with a different definition")]
    DuplicateType(String),

    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("type name '{name}' is ambiguous, use one of: {}", .candidates.join(", "))]
    AmbiguousType { name: String, candidates: Vec<String> },
}

/// Mapping from scoped interface name to descriptor.
///
/// `A::Ping` and `B::Ping` are distinct types. A bare name such as `Ping`
/// resolves only while a single module declares it.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<TypeDescriptor>>,
    /// Bare name to the scoped names declaring it, in registration order.
    by_name: HashMap<String, Vec<String>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Re-registering an identical descriptor is a no-op.
    pub fn register(&mut self, descriptor: TypeDescriptor) -> Result<(), RegistryError> {
        let scoped = descriptor.scoped_name();
        if let Some(existing) = self.types.get(&scoped) {
            if existing.structurally_matches(&descriptor) {
                tracing::trace!(type_name = %scoped, "Identical type re-registered");
                return Ok(());
            }
            return Err(RegistryError::DuplicateType(scoped));
        }

        tracing::debug!(
            type_name = %scoped,
            operations = descriptor.operations.len(),
            "Registered type"
        );
        self.by_name
            .entry(descriptor.name.clone())
            .or_default()
            .push(scoped.clone());
        self.types.insert(scoped, Arc::new(descriptor));
        Ok(())
    }

    /// Register a batch, stopping at the first conflict.
    pub fn register_all(
        &mut self,
        descriptors: impl IntoIterator<Item = TypeDescriptor>,
    ) -> Result<(), RegistryError> {
        descriptors.into_iter().try_for_each(|d| self.register(d))
    }

    /// Resolve `Module::Name` (a leading `::` is allowed) or a bare name.
    pub fn lookup(&self, name: &str) -> Result<Arc<TypeDescriptor>, RegistryError> {
        let unknown = || RegistryError::UnknownType(name.to_string());

        let key = name.strip_prefix("::").unwrap_or(name);
        if let Some(descriptor) = self.types.get(key) {
            return Ok(Arc::clone(descriptor));
        }
        if key.contains("::") {
            return Err(unknown());
        }

        match self.by_name.get(key).map(Vec::as_slice) {
            Some([scoped]) => self.types.get(scoped).cloned().ok_or_else(unknown),
            Some(candidates) if !candidates.is_empty() => Err(RegistryError::AmbiguousType {
                name: name.to_string(),
                candidates: candidates.to_vec(),
            }),
            _ => Err(unknown()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_ok()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Registered scoped names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
