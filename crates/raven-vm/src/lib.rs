//! raven-vm — boucle de dispatch, frames d'appel, natives et sandbox
//! `import` pour la VM bytecode Raven.
//!
//! Expose [`Vm`], point d'entrée unique pour exécuter une source ou un
//! fichier `.rvn` : compile via `raven-compiler`, exécute via
//! [`exec::run_until`], et restitue soit la valeur de sortie, soit une
//! [`VmError`] richement tracée (§7).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

mod error;
mod exec;
mod natives;
mod vm;

pub use error::{RuntimeError, TraceEntry, VmError};
pub use exec::{CallFrame, ExecState};
pub use vm::{Vm, VmOptions};

/// Alias de résultat pour ce crate.
pub type Result<T> = std::result::Result<T, VmError>;
