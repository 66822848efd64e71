//! raven-compiler — lexer + compilateur Pratt à passe unique pour Raven.
//!
//! API publique : [`compile_str`] / [`compile_file`], miroir de la paire
//! `compile_str`/`compile_file` du frontend voisin, mais produisant
//! directement un prototype de fonction alloué dans le tas d'une VM
//! (`raven-core::ObjRef`) plutôt qu'un `Chunk` autonome — Raven n'a pas de
//! format de bytecode sérialisable indépendant du tas qui l'a produit.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

mod compiler;
mod error;
mod lexer;

use std::fs;
use std::path::Path;

use raven_core::{Heap, ObjRef};

pub use compiler::compile;
pub use error::{CompileError, CompileErrors, Result};
pub use lexer::{Lexer, Token, TokenKind};

/// Compile une source en mémoire en prototype top-level, alloué dans `heap`.
pub fn compile_str(source: &str, file: impl Into<String>, heap: &mut Heap) -> Result<ObjRef> {
    compile(source, file, heap)
}

/// Lit et compile un fichier `.rvn`. L'erreur de lecture est remontée comme
/// une unique [`CompileError`] à la ligne 0, pour rester dans le même canal
/// d'erreurs que les échecs de compilation (§7).
pub fn compile_file(path: impl AsRef<Path>, heap: &mut Heap) -> Result<ObjRef> {
    let path = path.as_ref();
    let src = fs::read_to_string(path).map_err(|e| {
        CompileErrors(vec![CompileError {
            file: path.display().to_string(),
            line: 0,
            lexeme: String::new(),
            message: format!("cannot read source file: {e}"),
        }])
    })?;
    compile_str(&src, path.display().to_string(), heap)
}
