//! Syntax tree produced by the parser.

/// A type as written in the source, before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeExpr {
    /// Builtin or (possibly scoped) user-defined name.
    Named(String),
    /// `Name*`
    Proxy(String),
}

impl TypeExpr {
    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) | Self::Proxy(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDef {
    pub name: String,
    pub ty: TypeExpr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDef {
    pub name: String,
    pub returns: TypeExpr,
    pub params: Vec<ParamDef>,
    pub idempotent: bool,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDef {
    pub name: String,
    pub bases: Vec<String>,
    pub operations: Vec<OperationDef>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Definition {
    Module {
        name: String,
        definitions: Vec<Definition>,
    },
    Interface(InterfaceDef),
    /// `interface Name;`
    ForwardInterface(String),
    /// `sequence<T> Name;`
    Sequence {
        name: String,
        element: TypeExpr,
        line: usize,
    },
}

/// One parsed file and its position in the include graph.
#[derive(Debug, Clone)]
pub struct Unit {
    pub file: String,
    /// Named on the command line rather than reached through `#include`.
    pub top_level: bool,
    pub definitions: Vec<Definition>,
}
