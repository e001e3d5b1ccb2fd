use std::fs;
use std::path::Path;

use orbit::{RegistryError, TypeRegistry};
use orbit_schema::error::SchemaError;
use orbit_schema::{CompileOptions, compile, compile_command, compile_files, compile_str};

const COMMON: &str = r#"
#pragma once
module Common
{
    sequence<string> StringSeq;

    interface Named
    {
        idempotent string getName();
    };
};
"#;

const TEST: &str = r#"
#pragma once
#include <Common.ice>

module Test
{
    interface Initial extends Common::Named
    {
        string echo(string message);
        int add(int a, int b);
        Common::StringSeq split(string text);
        void shutdown();
    };
};
"#;

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

#[test]
fn include_dirs_and_all() {
    let includes = tempfile::tempdir().unwrap();
    let sources = tempfile::tempdir().unwrap();
    write(includes.path(), "Common.ice", COMMON);
    write(sources.path(), "Test.ice", TEST);

    let options = CompileOptions::new().include_dir(includes.path());
    let only_named = compile(sources.path().join("Test.ice"), &options).unwrap();
    assert_eq!(only_named.len(), 1);
    assert_eq!(only_named[0].name, "Initial");
    let ops: Vec<_> = only_named[0]
        .operations
        .iter()
        .map(|o| o.name.as_str())
        .collect();
    assert_eq!(ops, vec!["getName", "echo", "add", "split", "shutdown"]);

    let everything = compile(sources.path().join("Test.ice"), &options.clone().all(true)).unwrap();
    let names: Vec<_> = everything.iter().map(|d| d.scoped_name()).collect();
    assert_eq!(names, vec!["Common::Named", "Test::Initial"]);

    let mut registry = TypeRegistry::new();
    registry.register_all(everything).unwrap();
    assert!(registry.contains("Named"));
    assert_eq!(registry.lookup("Initial").unwrap().operations.len(), 5);
}

#[test]
fn command_string_form() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Common.ice", COMMON);
    write(dir.path(), "Test.ice", TEST);

    let command = format!(
        "--all -I{} {}",
        dir.path().display(),
        dir.path().join("Test.ice").display()
    );
    let descriptors = compile_command(&command).unwrap();
    assert_eq!(descriptors.len(), 2);
}

#[test]
fn quoted_include_is_found_next_to_the_includer() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Common.ice", COMMON);
    write(
        dir.path(),
        "Test.ice",
        &TEST.replace("#include <Common.ice>", "#include \"Common.ice\""),
    );

    let descriptors = compile(dir.path().join("Test.ice"), &CompileOptions::new()).unwrap();
    assert_eq!(descriptors.len(), 1);
}

#[test]
fn angle_include_needs_an_include_dir() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Common.ice", COMMON);
    write(dir.path(), "Test.ice", TEST);

    let err = compile(dir.path().join("Test.ice"), &CompileOptions::new()).unwrap_err();
    assert!(matches!(
        err,
        SchemaError::IncludeNotFound { include, .. } if include == "Common.ice"
    ));
}

#[test]
fn shared_include_is_loaded_once() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Common.ice", COMMON);
    write(dir.path(), "Test.ice", TEST);
    write(
        dir.path(),
        "Other.ice",
        "#include <Common.ice>\nmodule Other { interface Thing extends Common::Named {}; };\n",
    );

    let options = CompileOptions::new().include_dir(dir.path()).all(true);
    let descriptors = compile_files(
        &[dir.path().join("Test.ice"), dir.path().join("Other.ice")],
        &options,
    )
    .unwrap();
    let names: Vec<_> = descriptors.iter().map(|d| d.scoped_name()).collect();
    assert_eq!(names, vec!["Common::Named", "Test::Initial", "Other::Thing"]);
}

#[test]
fn errors_in_included_files_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Common.ice", "module Common { interface Named { bogus };\n");
    write(dir.path(), "Test.ice", TEST);

    let options = CompileOptions::new().include_dir(dir.path());
    let err = compile(dir.path().join("Test.ice"), &options).unwrap_err();
    match err {
        SchemaError::Syntax { file, .. } => assert!(file.ends_with("Common.ice"), "{file}"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn same_interface_name_in_two_modules() {
    let source = "module A { interface Ping { void go(); }; };\n\
                  module B { interface Ping { int other(); }; };\n";
    let descriptors = compile_str(source, "Ping.ice", &CompileOptions::new()).unwrap();

    let mut registry = TypeRegistry::new();
    registry.register_all(descriptors).unwrap();
    assert_eq!(registry.names(), vec!["A::Ping", "B::Ping"]);
    assert!(registry.lookup("B::Ping").unwrap().operation("other").is_some());
    assert!(matches!(
        registry.lookup("Ping"),
        Err(RegistryError::AmbiguousType { .. })
    ));
}
