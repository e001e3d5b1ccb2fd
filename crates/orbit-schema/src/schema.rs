//! Lowering of parsed units into registry descriptors.
//!
//! 1. Collect every module-scoped symbol (interfaces, forward declarations,
//!    sequence aliases) across all units, in declaration order
//! 2. Resolve names the way scoped lookup works: innermost module outwards,
//!    or absolute with a leading `::`
//! 3. Flatten inheritance so each descriptor lists inherited operations first
//! 4. Emit descriptors for interfaces from top-level units (or all units)

use std::collections::HashMap;

use indexmap::IndexMap;
use orbit::{OperationSignature, TypeDescriptor, TypeRef};

use crate::error::{Result, SchemaError};
use crate::types::*;

struct InterfaceEntry<'a> {
    module: Vec<String>,
    def: &'a InterfaceDef,
    emit: bool,
}

struct SequenceEntry<'a> {
    module: Vec<String>,
    element: &'a TypeExpr,
}

enum Symbol<'a> {
    Interface(InterfaceEntry<'a>),
    Forward,
    Sequence(SequenceEntry<'a>),
}

/// Symbols keyed by scoped name (`Test::Initial`), in declaration order.
struct SymbolTable<'a> {
    symbols: IndexMap<String, Symbol<'a>>,
}

pub fn lower(units: &[Unit], all: bool) -> Result<Vec<TypeDescriptor>> {
    let table = SymbolTable::build(units, all)?;
    table.check_sequences()?;

    let mut memo = HashMap::new();
    let mut descriptors = Vec::new();
    for (key, symbol) in &table.symbols {
        let Symbol::Interface(entry) = symbol else {
            continue;
        };
        // Flatten every interface so errors in included files still surface.
        let operations = table.flatten(key, entry, &mut memo, &mut Vec::new())?;
        if !entry.emit {
            continue;
        }

        let mut descriptor = TypeDescriptor::new(&entry.def.name);
        if !entry.module.is_empty() {
            descriptor = descriptor.with_module(entry.module.join("::"));
        }
        descriptor.operations = operations;
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}

fn scoped(scope: &[String], name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}::{name}", scope.join("::"))
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

impl<'a> SymbolTable<'a> {
    fn build(units: &'a [Unit], all: bool) -> Result<Self> {
        let mut table = Self {
            symbols: IndexMap::new(),
        };
        for unit in units {
            table.collect(&unit.definitions, &mut Vec::new(), unit.top_level || all)?;
        }
        Ok(table)
    }

    fn collect(
        &mut self,
        definitions: &'a [Definition],
        scope: &mut Vec<String>,
        emit: bool,
    ) -> Result<()> {
        for definition in definitions {
            match definition {
                // Modules may be reopened, in the same file or another.
                Definition::Module { name, definitions } => {
                    scope.push(name.clone());
                    self.collect(definitions, scope, emit)?;
                    scope.pop();
                }
                Definition::Interface(def) => {
                    let key = scoped(scope, &def.name);
                    if matches!(self.symbols.get(&key), Some(Symbol::Interface(_) | Symbol::Sequence(_))) {
                        return Err(SchemaError::DuplicateDefinition(key));
                    }
                    self.symbols.insert(
                        key,
                        Symbol::Interface(InterfaceEntry {
                            module: scope.clone(),
                            def,
                            emit,
                        }),
                    );
                }
                Definition::ForwardInterface(name) => {
                    let key = scoped(scope, name);
                    match self.symbols.get(&key) {
                        Some(Symbol::Sequence(_)) => return Err(SchemaError::DuplicateDefinition(key)),
                        Some(_) => {}
                        None => {
                            self.symbols.insert(key, Symbol::Forward);
                        }
                    }
                }
                Definition::Sequence { name, element, .. } => {
                    let key = scoped(scope, name);
                    if self.symbols.contains_key(&key) {
                        return Err(SchemaError::DuplicateDefinition(key));
                    }
                    self.symbols.insert(
                        key,
                        Symbol::Sequence(SequenceEntry {
                            module: scope.clone(),
                            element,
                        }),
                    );
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str, scope: &[String]) -> Option<(&str, &Symbol<'a>)> {
        if let Some(absolute) = name.strip_prefix("::") {
            return self
                .symbols
                .get_key_value(absolute)
                .map(|(k, v)| (k.as_str(), v));
        }
        (0..=scope.len()).rev().find_map(|depth| {
            self.symbols
                .get_key_value(&scoped(&scope[..depth], name))
                .map(|(k, v)| (k.as_str(), v))
        })
    }

    fn type_ref(
        &self,
        expr: &TypeExpr,
        scope: &[String],
        context: &str,
        allow_void: bool,
    ) -> Result<TypeRef> {
        let unresolved = || SchemaError::UnresolvedType {
            name: expr.name().to_string(),
            context: context.to_string(),
        };

        match expr {
            TypeExpr::Named(name) => {
                if let Some(builtin) = TypeRef::from_builtin(name) {
                    if builtin == TypeRef::Void && !allow_void {
                        return Err(unresolved());
                    }
                    return Ok(builtin);
                }
                match self.resolve(name, scope) {
                    Some((_, Symbol::Sequence(_))) => Ok(TypeRef::Named(last_segment(name).to_string())),
                    Some((_, Symbol::Interface(_) | Symbol::Forward)) => {
                        Ok(TypeRef::Proxy(last_segment(name).to_string()))
                    }
                    None => Err(unresolved()),
                }
            }
            TypeExpr::Proxy(name) => match self.resolve(name, scope) {
                Some((_, Symbol::Interface(_) | Symbol::Forward)) => {
                    Ok(TypeRef::Proxy(last_segment(name).to_string()))
                }
                _ => Err(unresolved()),
            },
        }
    }

    fn check_sequences(&self) -> Result<()> {
        for (key, symbol) in &self.symbols {
            if let Symbol::Sequence(entry) = symbol {
                self.type_ref(entry.element, &entry.module, key, false)?;
            }
        }
        Ok(())
    }

    fn flatten(
        &self,
        key: &str,
        entry: &InterfaceEntry<'a>,
        memo: &mut HashMap<String, Vec<OperationSignature>>,
        visiting: &mut Vec<String>,
    ) -> Result<Vec<OperationSignature>> {
        if let Some(operations) = memo.get(key) {
            return Ok(operations.clone());
        }
        if visiting.iter().any(|v| v == key) {
            return Err(SchemaError::CyclicInheritance(key.to_string()));
        }
        visiting.push(key.to_string());

        let mut operations: Vec<OperationSignature> = Vec::new();
        for base in &entry.def.bases {
            let Some((base_key, Symbol::Interface(base_entry))) = self.resolve(base, &entry.module)
            else {
                return Err(SchemaError::UnknownBase {
                    interface: key.to_string(),
                    base: base.clone(),
                });
            };
            for inherited in self.flatten(base_key, base_entry, memo, visiting)? {
                match operations.iter().find(|op| op.name == inherited.name) {
                    // Same operation reached through two paths.
                    Some(existing) if *existing == inherited => {}
                    Some(_) => {
                        return Err(SchemaError::DuplicateOperation {
                            interface: key.to_string(),
                            operation: inherited.name,
                        });
                    }
                    None => operations.push(inherited),
                }
            }
        }

        for op in &entry.def.operations {
            if operations.iter().any(|existing| existing.name == op.name) {
                return Err(SchemaError::DuplicateOperation {
                    interface: key.to_string(),
                    operation: op.name.clone(),
                });
            }

            let context = format!("{key}::{}", op.name);
            let returns = self.type_ref(&op.returns, &entry.module, &context, true)?;
            let mut signature = OperationSignature::new(&op.name, returns);
            for param in &op.params {
                let ty = self.type_ref(&param.ty, &entry.module, &context, false)?;
                signature = signature.with_param(&param.name, ty);
            }
            if op.idempotent {
                signature = signature.idempotent();
            }
            operations.push(signature);
        }

        visiting.pop();
        memo.insert(key.to_string(), operations.clone());
        Ok(operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_definitions;

    fn unit(file: &str, src: &str, top_level: bool) -> Unit {
        Unit {
            file: file.to_string(),
            top_level,
            definitions: parse_definitions(src, file).unwrap(),
        }
    }

    const COMMON: &str = r#"
        module Common {
            sequence<string> StringSeq;
            interface Named { idempotent string getName(); };
        };
    "#;

    const TEST: &str = r#"
        module Test {
            interface Initial extends Common::Named {
                string echo(string message);
                Common::StringSeq split(string text);
                void shutdown();
            };
        };
    "#;

    #[test]
    fn inherited_operations_come_first() {
        let units = vec![unit("Common.ice", COMMON, false), unit("Test.ice", TEST, true)];
        let descriptors = lower(&units, false).unwrap();
        insta::assert_json_snapshot!(descriptors, @r#"
        [
          {
            "name": "Initial",
            "module": "Test",
            "operations": [
              {
                "name": "getName",
                "params": [],
                "returns": {
                  "kind": "string"
                },
                "idempotent": true
              },
              {
                "name": "echo",
                "params": [
                  {
                    "name": "message",
                    "ty": {
                      "kind": "string"
                    }
                  }
                ],
                "returns": {
                  "kind": "string"
                }
              },
              {
                "name": "split",
                "params": [
                  {
                    "name": "text",
                    "ty": {
                      "kind": "string"
                    }
                  }
                ],
                "returns": {
                  "kind": "named",
                  "of": "StringSeq"
                }
              },
              {
                "name": "shutdown",
                "params": [],
                "returns": {
                  "kind": "void"
                }
              }
            ]
          }
        ]
        "#);
    }

    #[test]
    fn all_includes_included_interfaces() {
        let units = vec![unit("Common.ice", COMMON, false), unit("Test.ice", TEST, true)];
        let names: Vec<_> = lower(&units, true)
            .unwrap()
            .into_iter()
            .map(|d| d.scoped_name())
            .collect();
        assert_eq!(names, vec!["Common::Named", "Test::Initial"]);
    }

    #[test]
    fn unknown_types_are_reported_with_context() {
        let src = "module M { interface I { Missing get(); }; };";
        let err = lower(&[unit("M.ice", src, true)], false).unwrap_err();
        match err {
            SchemaError::UnresolvedType { name, context } => {
                assert_eq!(name, "Missing");
                assert_eq!(context, "M::I::get");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn void_parameters_are_rejected() {
        let src = "interface I { void f(void x); };";
        assert!(matches!(
            lower(&[unit("I.ice", src, true)], false),
            Err(SchemaError::UnresolvedType { .. })
        ));
    }

    #[test]
    fn forward_declarations_resolve_as_proxies() {
        let src = r#"
            module M {
                interface Later;
                interface First { Later* next(); };
                interface Later { First* back(); };
            };
        "#;
        let descriptors = lower(&[unit("M.ice", src, true)], false).unwrap();
        assert_eq!(descriptors.len(), 2);
        let first = descriptors.iter().find(|d| d.name == "First").unwrap();
        assert_eq!(first.operations[0].returns, TypeRef::Proxy("Later".to_string()));
    }

    #[test]
    fn inheritance_errors() {
        let cyclic = "interface A extends B {}; interface B extends A {};";
        assert!(matches!(
            lower(&[unit("C.ice", cyclic, true)], false),
            Err(SchemaError::CyclicInheritance(_))
        ));

        let unknown = "interface A extends Nope {};";
        assert!(matches!(
            lower(&[unit("U.ice", unknown, true)], false),
            Err(SchemaError::UnknownBase { .. })
        ));

        let clash = "interface A { void f(); }; interface B extends A { int f(); };";
        assert!(matches!(
            lower(&[unit("D.ice", clash, true)], false),
            Err(SchemaError::DuplicateOperation { .. })
        ));
    }

    #[test]
    fn diamond_inheritance_is_merged() {
        let src = r#"
            interface Base { void ping(); };
            interface Left extends Base {};
            interface Right extends Base {};
            interface Both extends Left, Right { void both(); };
        "#;
        let descriptors = lower(&[unit("D.ice", src, true)], false).unwrap();
        let both = descriptors.iter().find(|d| d.name == "Both").unwrap();
        let names: Vec<_> = both.operations.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["ping", "both"]);
    }

    #[test]
    fn duplicate_definitions_fail() {
        let src = "module M { interface I {}; }; module M { interface I {}; };";
        assert!(matches!(
            lower(&[unit("M.ice", src, true)], false),
            Err(SchemaError::DuplicateDefinition(name)) if name == "M::I"
        ));
    }
}
