pub mod error;
pub mod parser;
pub mod schema;
pub mod types;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use orbit::TypeDescriptor;

use crate::error::{Result, SchemaError};
use crate::parser::Include;
use crate::types::Unit;

/// Options shared by every file in one compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Searched, in order, for `#include` targets.
    pub include_dirs: Vec<PathBuf>,
    /// Emit descriptors for included files too, not only the named ones.
    pub all: bool,
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    pub fn all(mut self, all: bool) -> Self {
        self.all = all;
        self
    }

    /// Parse compiler arguments: `--all`, `-I<dir>` / `-I <dir>`, then input files.
    pub fn from_args<I, S>(args: I) -> Result<(Self, Vec<PathBuf>)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::new();
        let mut files = Vec::new();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let arg = arg.as_ref();
            match arg {
                "--all" => options.all = true,
                "-I" => {
                    let dir = args
                        .next()
                        .ok_or_else(|| SchemaError::InvalidArgs("-I requires a directory".into()))?;
                    options.include_dirs.push(PathBuf::from(dir.as_ref()));
                }
                arg if arg.starts_with("-I") => options.include_dirs.push(PathBuf::from(&arg[2..])),
                arg if arg.starts_with('-') => {
                    return Err(SchemaError::InvalidArgs(format!("unknown flag: {arg}")));
                }
                file => files.push(PathBuf::from(file)),
            }
        }

        Ok((options, files))
    }
}

/// Compile one interface file and everything it includes.
pub fn compile(path: impl AsRef<Path>, options: &CompileOptions) -> Result<Vec<TypeDescriptor>> {
    compile_files(&[path.as_ref()], options)
}

/// Compile several top-level files as one unit of name resolution.
pub fn compile_files<P: AsRef<Path>>(
    paths: &[P],
    options: &CompileOptions,
) -> Result<Vec<TypeDescriptor>> {
    let mut loader = Loader::new(options);
    for path in paths {
        loader.load_top_level(path.as_ref())?;
    }
    let descriptors = schema::lower(&loader.units, options.all)?;
    tracing::info!(
        files = loader.units.len(),
        types = descriptors.len(),
        "Compiled interface definitions"
    );
    Ok(descriptors)
}

/// Compile from a command string such as `--all -I. Test.ice`.
pub fn compile_command(command: &str) -> Result<Vec<TypeDescriptor>> {
    let (options, files) = CompileOptions::from_args(command.split_whitespace())?;
    if files.is_empty() {
        return Err(SchemaError::InvalidArgs("no input files".into()));
    }
    compile_files(&files, &options)
}

/// Compile in-memory source. Includes resolve against the include directories.
pub fn compile_str(
    source: &str,
    name: &str,
    options: &CompileOptions,
) -> Result<Vec<TypeDescriptor>> {
    let mut loader = Loader::new(options);
    loader.load_source(source, name, None, true)?;
    schema::lower(&loader.units, options.all)
}

struct Loader<'a> {
    options: &'a CompileOptions,
    units: Vec<Unit>,
    /// Canonical path → index into `units`, once parsed.
    parsed: HashMap<PathBuf, usize>,
    /// Canonical paths whose loading has started; guards include cycles.
    started: HashSet<PathBuf>,
}

impl<'a> Loader<'a> {
    fn new(options: &'a CompileOptions) -> Self {
        Self {
            options,
            units: Vec::new(),
            parsed: HashMap::new(),
            started: HashSet::new(),
        }
    }

    fn load_top_level(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(SchemaError::FileNotFound(path.display().to_string()));
        }
        self.load(path, true)
    }

    fn load(&mut self, path: &Path, top_level: bool) -> Result<()> {
        let canonical = path.canonicalize().map_err(|source| SchemaError::Read {
            path: path.display().to_string(),
            source,
        })?;

        if !self.started.insert(canonical.clone()) {
            // Named on the command line after being included: promote it.
            if top_level && let Some(&index) = self.parsed.get(&canonical) {
                self.units[index].top_level = true;
            }
            return Ok(());
        }

        let source = std::fs::read_to_string(&canonical).map_err(|source| SchemaError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file = path.display().to_string();
        let index = self.load_source(&source, &file, canonical.parent(), top_level)?;
        self.parsed.insert(canonical, index);
        Ok(())
    }

    /// Parse `source` after its includes; returns the unit's index.
    fn load_source(
        &mut self,
        source: &str,
        file: &str,
        dir: Option<&Path>,
        top_level: bool,
    ) -> Result<usize> {
        let preprocessed = parser::preprocess(source, file)?;
        for include in &preprocessed.includes {
            let resolved =
                self.resolve_include(include, dir)
                    .ok_or_else(|| SchemaError::IncludeNotFound {
                        file: file.to_string(),
                        include: include.path.clone(),
                    })?;
            tracing::debug!(file, include = %resolved.display(), "Following include");
            self.load(&resolved, false)?;
        }

        let definitions = parser::parse_definitions(&preprocessed.body, file)?;
        tracing::debug!(file, definitions = definitions.len(), top_level, "Parsed interface file");
        self.units.push(Unit {
            file: file.to_string(),
            top_level,
            definitions,
        });
        Ok(self.units.len() - 1)
    }

    fn resolve_include(&self, include: &Include, dir: Option<&Path>) -> Option<PathBuf> {
        let local = dir
            .filter(|_| include.quoted)
            .map(|dir| dir.join(&include.path));
        local
            .into_iter()
            .chain(self.options.include_dirs.iter().map(|d| d.join(&include.path)))
            .find(|candidate| candidate.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compiler_arguments() {
        let (options, files) =
            CompileOptions::from_args(["--all", "-I.", "-I", "slice", "Test.ice"]).unwrap();
        assert!(options.all);
        assert_eq!(
            options.include_dirs,
            vec![PathBuf::from("."), PathBuf::from("slice")]
        );
        assert_eq!(files, vec![PathBuf::from("Test.ice")]);

        assert!(matches!(
            CompileOptions::from_args(["-I"]),
            Err(SchemaError::InvalidArgs(_))
        ));
        assert!(matches!(
            CompileOptions::from_args(["--bogus"]),
            Err(SchemaError::InvalidArgs(_))
        ));
    }

    #[test]
    fn compile_str_without_includes() {
        let descriptors = compile_str(
            "module Test { interface Initial { void shutdown(); }; };",
            "inline.ice",
            &CompileOptions::new(),
        )
        .unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].scoped_name(), "Test::Initial");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = compile("/definitely/not/here.ice", &CompileOptions::new()).unwrap_err();
        assert!(matches!(err, SchemaError::FileNotFound(_)));
    }

    #[test]
    fn command_requires_files() {
        assert!(matches!(
            compile_command("--all -I."),
            Err(SchemaError::InvalidArgs(_))
        ));
    }
}
