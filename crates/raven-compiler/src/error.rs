//! error.rs — diagnostics de compilation (§7 — erreurs de syntaxe).

use thiserror::Error;

/// Une erreur de compilation, localisée (§7 — "one-line ... `[path | line: N]`").
#[derive(Debug, Error, Clone, PartialEq)]
#[error("[{file} | line: {line}] {message} (at '{lexeme}')")]
pub struct CompileError {
    /// Chemin source (ou `<stdin>`/`<memory>`).
    pub file: String,
    /// Ligne source de l'erreur.
    pub line: u32,
    /// Lexème fautif (vide en cas d'erreur de fin de fichier).
    pub lexeme: String,
    /// Message explicatif.
    pub message: String,
}

/// Un compile échoué : le chunk n'est pas livré à la VM (§7 — propagation
/// policy), mais les erreurs accumulées pendant la passe unique sont
/// rapportées ensemble.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("compilation failed with {} error(s)", .0.len())]
pub struct CompileErrors(pub Vec<CompileError>);

/// Alias de résultat pour ce crate.
pub type Result<T> = std::result::Result<T, CompileErrors>;
