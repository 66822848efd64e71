//! error.rs — erreurs publiques de `raven-core`.
//!
//! Suit le même schéma que le reste du workspace : un seul enum
//! `thiserror`, pas de `anyhow` ici (ce crate n'a pas de contexte
//! applicatif à enrichir, `raven-cli` s'en charge).

use thiserror::Error;

/// Erreurs pouvant survenir lors de la manipulation d'un [`crate::bytecode::Chunk`]
/// ou du tas ([`crate::gc::Heap`]).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Le pool de constantes d'une fonction a dépassé 256 entrées.
    #[error("constant pool overflow: cannot hold more than {limit} constants")]
    ConstPoolOverflow {
        /// Limite dépassée (toujours 256 ici).
        limit: usize,
    },

    /// Un saut dépasserait la portée 16 bits.
    #[error("jump offset {offset} exceeds u16::MAX")]
    JumpTooFar {
        /// Magnitude calculée du saut.
        offset: i64,
    },

    /// Table des upvalues pleine pour une fonction.
    #[error("upvalue table overflow: cannot hold more than {limit} upvalues")]
    UpvalueOverflow {
        /// Limite dépassée (toujours 256 ici).
        limit: usize,
    },

    /// Erreur générique remontée par un appelant (message déjà formaté).
    #[error("{0}")]
    Msg(String),
}

/// Alias de résultat pour ce crate.
pub type Result<T, E = CoreError> = core::result::Result<T, E>;
