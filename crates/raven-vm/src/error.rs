//! error.rs — erreurs d'exécution et mise en forme de la pile d'appels (§7).

use std::fmt;

use thiserror::Error;

/// Une entrée de la pile d'appels au moment d'une erreur runtime, dans
/// l'ordre `innermost-first` (§7 — "stack traceback ... innermost first by
/// default").
#[derive(Debug, Clone)]
pub struct TraceEntry {
    /// Fichier source de la frame.
    pub file: String,
    /// Ligne courante dans cette frame.
    pub line: u32,
    /// Nom de la fonction, ou `<toplevel>`.
    pub function: String,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\t{} | line:{} in {}", self.file, self.line, self.function)
    }
}

/// Erreur runtime complète : message, position, et traceback (§7 — "one-line
/// ... `[path | line: N]` prefix").
#[derive(Debug, Clone)]
pub struct RuntimeError {
    /// Fichier où l'erreur s'est produite.
    pub file: String,
    /// Ligne source courante.
    pub line: u32,
    /// Message explicatif.
    pub message: String,
    /// Trace d'appel, innermost en premier.
    pub trace: Vec<TraceEntry>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{} | line: {}] {}", self.file, self.line, self.message)?;
        writeln!(f, "stack traceback:")?;
        for entry in &self.trace {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Erreur publique de `raven-vm` : échec de compilation (propagé tel quel
/// depuis `raven-compiler`) ou échec d'exécution.
#[derive(Debug, Error)]
pub enum VmError {
    /// La compilation préalable a échoué ; la VM n'a jamais démarré.
    #[error(transparent)]
    Compile(#[from] raven_compiler::CompileErrors),
    /// Échec pendant l'exécution (§7, kind 2).
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    /// Échec de lecture d'un fichier source/importé.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Chemin qui a échoué.
        path: String,
        /// Erreur d'E/S sous-jacente.
        #[source]
        source: std::io::Error,
    },
}

/// Alias de résultat pour ce crate.
pub type Result<T> = std::result::Result<T, VmError>;
