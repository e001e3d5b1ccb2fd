//! Preprocessor, tokenizer and recursive-descent parser for interface files.
//!
//! Supported subset:
//! - `#include <File.ice>` / `#include "File.ice"`, `#pragma once`, include guards
//! - `module Name { ... };` (nestable)
//! - `interface Name [extends A, B::C] { ... };` and forward declarations
//! - `sequence<T> Name;`
//! - operations `[idempotent] Ret name(T a, U b) [throws E];`
//! - `[...]` metadata, which is skipped

use crate::error::{Result, SchemaError};
use crate::types::*;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    pub path: String,
    /// `"File.ice"` rather than `<File.ice>`: also searched next to the includer.
    pub quoted: bool,
    pub line: usize,
}

/// Source with directives removed. Directive lines become blank so line
/// numbers in later errors still match the file.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub includes: Vec<Include>,
    pub body: String,
}

pub fn preprocess(source: &str, file: &str) -> Result<Preprocessed> {
    let mut includes = Vec::new();
    let mut body = String::with_capacity(source.len());

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim_start();
        let Some(directive) = trimmed.strip_prefix('#') else {
            body.push_str(raw);
            body.push('\n');
            continue;
        };
        body.push('\n');

        let directive = directive.trim();
        let (name, rest) = directive
            .split_once(char::is_whitespace)
            .map(|(n, r)| (n, r.trim()))
            .unwrap_or((directive, ""));

        match name {
            "include" => includes.push(parse_include(rest, file, line)?),
            // Guards are redundant: every file is loaded at most once.
            "pragma" | "ifndef" | "define" | "endif" => {}
            other => {
                return Err(syntax(file, line, format!("unsupported directive '#{other}'")));
            }
        }
    }

    Ok(Preprocessed { includes, body })
}

pub fn parse_definitions(body: &str, file: &str) -> Result<Vec<Definition>> {
    let tokens = tokenize(body, file)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        file,
    };
    let definitions = parser.definitions(None)?;
    Ok(definitions)
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

fn parse_include(rest: &str, file: &str, line: usize) -> Result<Include> {
    let (open, close, quoted) = match rest.chars().next() {
        Some('<') => ('<', '>', false),
        Some('"') => ('"', '"', true),
        _ => return Err(syntax(file, line, "expected <file> or \"file\" after #include")),
    };
    let inner = rest
        .strip_prefix(open)
        .and_then(|r| r.split_once(close))
        .map(|(path, _)| path.trim())
        .filter(|path| !path.is_empty())
        .ok_or_else(|| syntax(file, line, "malformed #include"))?;

    Ok(Include {
        path: inner.to_string(),
        quoted,
        line,
    })
}

fn syntax(file: &str, line: usize, message: impl Into<String>) -> SchemaError {
    SchemaError::Syntax {
        file: file.to_string(),
        line,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Sym(&'static str),
    Str(String),
    Eof,
}

impl std::fmt::Display for Tok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "'{name}'"),
            Self::Sym(sym) => write!(f, "'{sym}'"),
            Self::Str(_) => f.write_str("string literal"),
            Self::Eof => f.write_str("end of file"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn symbol(c: char) -> Option<&'static str> {
    Some(match c {
        '{' => "{",
        '}' => "}",
        '(' => "(",
        ')' => ")",
        ';' => ";",
        ',' => ",",
        '<' => "<",
        '>' => ">",
        '*' => "*",
        '[' => "[",
        ']' => "]",
        _ => return None,
    })
}

fn tokenize(src: &str, file: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                let start = line;
                i += 2;
                loop {
                    match (chars.get(i).copied(), chars.get(i + 1).copied()) {
                        (Some('*'), Some('/')) => {
                            i += 2;
                            break;
                        }
                        (Some('\n'), _) => line += 1,
                        (Some(_), _) => {}
                        (None, _) => return Err(syntax(file, start, "unterminated comment")),
                    }
                    i += 1;
                }
            }
            ':' if next == Some(':') => {
                tokens.push(Token {
                    tok: Tok::Sym("::"),
                    line,
                });
                i += 2;
            }
            '"' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != '"' {
                    if chars[end] == '\n' {
                        return Err(syntax(file, line, "unterminated string literal"));
                    }
                    end += 1;
                }
                if end == chars.len() {
                    return Err(syntax(file, line, "unterminated string literal"));
                }
                tokens.push(Token {
                    tok: Tok::Str(chars[start..end].iter().collect()),
                    line,
                });
                i = end + 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Ident(chars[start..i].iter().collect()),
                    line,
                });
            }
            c => match symbol(c) {
                Some(sym) => {
                    tokens.push(Token {
                        tok: Tok::Sym(sym),
                        line,
                    });
                    i += 1;
                }
                None => return Err(syntax(file, line, format!("unexpected character '{c}'"))),
            },
        }
    }

    tokens.push(Token { tok: Tok::Eof, line });
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Definition keywords outside the supported subset.
const UNSUPPORTED: &[&str] = &[
    "class",
    "struct",
    "enum",
    "exception",
    "dictionary",
    "const",
    "local",
];

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    file: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> SchemaError {
        syntax(self.file, self.line(), message)
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Tok::Sym(s) if *s == sym) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{sym}', found {}", self.peek())))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        if let Tok::Ident(name) = self.peek() {
            let name = name.clone();
            self.advance();
            return Ok(name);
        }
        Err(self.error(format!("expected {what}, found {}", self.peek())))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Tok::Ident(name) if name == keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Skip `["a", "b"]` and `[["a"]]` metadata.
    fn skip_metadata(&mut self) -> Result<()> {
        while self.eat_sym("[") {
            let mut depth = 1;
            while depth > 0 {
                match self.advance() {
                    Tok::Sym("[") => depth += 1,
                    Tok::Sym("]") => depth -= 1,
                    Tok::Eof => return Err(self.error("unterminated metadata")),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Definitions until `end` (a closing brace) or end of file.
    fn definitions(&mut self, end: Option<&str>) -> Result<Vec<Definition>> {
        let mut definitions = Vec::new();
        loop {
            self.skip_metadata()?;
            match (self.peek(), end) {
                (Tok::Eof, None) => return Ok(definitions),
                (Tok::Eof, Some(end)) => {
                    return Err(self.error(format!("expected '{end}' before end of file")));
                }
                (Tok::Sym(s), Some(end)) if *s == end => return Ok(definitions),
                _ => definitions.push(self.definition()?),
            }
        }
    }

    fn definition(&mut self) -> Result<Definition> {
        let keyword = self.expect_ident("a definition")?;
        match keyword.as_str() {
            "module" => self.module(),
            "interface" => self.interface(),
            "sequence" => self.sequence(),
            other if UNSUPPORTED.contains(&other) => {
                Err(self.error(format!("'{other}' definitions are not supported")))
            }
            other => Err(self.error(format!("unexpected '{other}', expected a definition"))),
        }
    }

    fn module(&mut self) -> Result<Definition> {
        let name = self.expect_ident("module name")?;
        self.expect_sym("{")?;
        let definitions = self.definitions(Some("}"))?;
        self.expect_sym("}")?;
        self.expect_sym(";")?;
        Ok(Definition::Module { name, definitions })
    }

    fn interface(&mut self) -> Result<Definition> {
        let line = self.line();
        let name = self.expect_ident("interface name")?;
        if self.eat_sym(";") {
            return Ok(Definition::ForwardInterface(name));
        }

        let mut bases = Vec::new();
        if self.eat_keyword("extends") {
            loop {
                bases.push(self.scoped_name()?);
                if !self.eat_sym(",") {
                    break;
                }
            }
        }

        self.expect_sym("{")?;
        let mut operations = Vec::new();
        loop {
            self.skip_metadata()?;
            if self.eat_sym("}") {
                break;
            }
            operations.push(self.operation()?);
        }
        self.expect_sym(";")?;

        Ok(Definition::Interface(InterfaceDef {
            name,
            bases,
            operations,
            line,
        }))
    }

    fn sequence(&mut self) -> Result<Definition> {
        let line = self.line();
        self.expect_sym("<")?;
        self.skip_metadata()?;
        let element = self.type_expr()?;
        self.expect_sym(">")?;
        let name = self.expect_ident("sequence name")?;
        self.expect_sym(";")?;
        Ok(Definition::Sequence {
            name,
            element,
            line,
        })
    }

    fn operation(&mut self) -> Result<OperationDef> {
        let line = self.line();
        let idempotent = self.eat_keyword("idempotent");
        let returns = self.type_expr()?;
        let name = self.expect_ident("operation name")?;

        self.expect_sym("(")?;
        let mut params = Vec::new();
        if !self.eat_sym(")") {
            loop {
                self.skip_metadata()?;
                if self.eat_keyword("out") {
                    return Err(self.error("out parameters are not supported"));
                }
                let ty = self.type_expr()?;
                let param = self.expect_ident("parameter name")?;
                params.push(ParamDef { name: param, ty });
                if self.eat_sym(")") {
                    break;
                }
                self.expect_sym(",")?;
            }
        }

        // Exceptions are accepted and ignored: failures travel as dispatch errors.
        if self.eat_keyword("throws") {
            loop {
                self.scoped_name()?;
                if !self.eat_sym(",") {
                    break;
                }
            }
        }
        self.expect_sym(";")?;

        Ok(OperationDef {
            name,
            returns,
            params,
            idempotent,
            line,
        })
    }

    fn type_expr(&mut self) -> Result<TypeExpr> {
        let name = self.scoped_name()?;
        if self.eat_sym("*") {
            Ok(TypeExpr::Proxy(name))
        } else {
            Ok(TypeExpr::Named(name))
        }
    }

    /// `Name`, `A::Name` or `::A::Name`.
    fn scoped_name(&mut self) -> Result<String> {
        let mut name = String::new();
        if self.eat_sym("::") {
            name.push_str("::");
        }
        name.push_str(&self.expect_ident("type name")?);
        while self.eat_sym("::") {
            name.push_str("::");
            name.push_str(&self.expect_ident("type name")?);
        }
        Ok(name)
    }
}
