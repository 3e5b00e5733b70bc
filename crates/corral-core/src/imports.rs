use oxc::{
    allocator::Allocator,
    ast::ast::{Declaration, ImportDeclarationSpecifier, Statement},
    parser::Parser,
    span::SourceType,
};

use crate::error::{Error, Result};

/// What linking needs to know about an ES module, read from its source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ModuleSyntax {
    /// Static import specifiers in source order.
    ///
    /// Re-exports (`export * from`, `export { x } from`) count as imports.
    /// Duplicates are kept; dynamic `import()` is not a static edge.
    pub(crate) specifiers: Vec<String>,
    /// `(specifier index, name)` for every binding the module requires from
    /// another module. A default import requires `default`.
    pub(crate) bindings: Vec<(usize, String)>,
    /// Names the module exports, re-exports by name included.
    pub(crate) exports: Vec<String>,
    /// Specifier indices of `export * from` declarations.
    pub(crate) star_exports: Vec<usize>,
}

/// Parse `source` as an ES module.
///
/// # Errors
/// Returns [`Error::Syntax`] naming `name` if the source does not parse.
pub(crate) fn extract(name: &str, source: &str) -> Result<ModuleSyntax> {
    let allocator = Allocator::default();
    let parsed = Parser::new(&allocator, source, SourceType::mjs()).parse();
    if let Some(diagnostic) = parsed.errors.first() {
        return Err(Error::Syntax {
            name: name.to_owned(),
            message: diagnostic.to_string(),
        });
    }

    let mut syntax = ModuleSyntax::default();
    for statement in &parsed.program.body {
        match statement {
            Statement::ImportDeclaration(decl) => {
                let index = syntax.push_specifier(&decl.source.value);
                for specifier in decl.specifiers.iter().flatten() {
                    match specifier {
                        ImportDeclarationSpecifier::ImportSpecifier(named) => {
                            syntax.bindings.push((index, named.imported.name().to_string()));
                        }
                        ImportDeclarationSpecifier::ImportDefaultSpecifier(_) => {
                            syntax.bindings.push((index, "default".to_owned()));
                        }
                        ImportDeclarationSpecifier::ImportNamespaceSpecifier(_) => {}
                    }
                }
            }
            Statement::ExportAllDeclaration(decl) => {
                let index = syntax.push_specifier(&decl.source.value);
                match &decl.exported {
                    Some(exported) => syntax.exports.push(exported.name().to_string()),
                    None => syntax.star_exports.push(index),
                }
            }
            Statement::ExportNamedDeclaration(decl) => {
                let index = decl
                    .source
                    .as_ref()
                    .map(|source| syntax.push_specifier(&source.value));
                for specifier in &decl.specifiers {
                    if let Some(index) = index {
                        syntax.bindings.push((index, specifier.local.name().to_string()));
                    }
                    syntax.exports.push(specifier.exported.name().to_string());
                }
                match &decl.declaration {
                    Some(Declaration::VariableDeclaration(vars)) => {
                        for declarator in &vars.declarations {
                            for ident in declarator.id.get_binding_identifiers() {
                                syntax.exports.push(ident.name.to_string());
                            }
                        }
                    }
                    Some(Declaration::FunctionDeclaration(function)) => {
                        syntax.exports.extend(function.id.iter().map(|id| id.name.to_string()));
                    }
                    Some(Declaration::ClassDeclaration(class)) => {
                        syntax.exports.extend(class.id.iter().map(|id| id.name.to_string()));
                    }
                    _ => {}
                }
            }
            Statement::ExportDefaultDeclaration(_) => syntax.exports.push("default".to_owned()),
            _ => {}
        }
    }
    Ok(syntax)
}

impl ModuleSyntax {
    fn push_specifier(&mut self, specifier: &str) -> usize {
        self.specifiers.push(specifier.to_owned());
        self.specifiers.len() - 1
    }

    pub(crate) fn exports(&self, name: &str) -> bool {
        self.exports.iter().any(|export| export == name)
    }
}
