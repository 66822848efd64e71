//! raven-core — modèle de données partagé par le compilateur et la VM Raven.
//!
//! Contient tout ce qu'il faut pour manipuler le bytecode Raven sans
//! dépendre du compilateur ni de la boucle d'exécution :
//!
//! - `bytecode` : format `Chunk`, pool de constantes, opcodes `Op`.
//! - `value`    : le type `Value` (nombre, booléen, nil, référence objet).
//! - `object`   : modèle objet du tas (chaînes, paires, tableaux, maps,
//!   fonctions, fermetures, upvalues, natives).
//! - `gc`       : allocateur par arène et collecteur mark-sweep traçant.
//! - `table`    : table de hachage à adressage ouvert (globales, maps).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

pub mod bytecode;
pub mod error;
pub mod gc;
pub mod object;
pub mod table;
pub mod value;

pub use error::{CoreError, Result};
pub use gc::Heap;
pub use object::{ClosureObj, FunctionProto, NativeCtx, NativeFn, NativeFnObj, ObjKind, ObjRef, Object, UpvalueDesc, UpvalueState};
pub use value::{display_value, Value};

/// Limite de la pile de frames d'appel (§3 — `FRAMES_LIMIT`).
pub const FRAMES_LIMIT: usize = 128;

/// Taille totale de la pile de valeurs (§3 — `STACK_SIZE = 256 × FRAMES_LIMIT`).
pub const STACK_SIZE: usize = 256 * FRAMES_LIMIT;

/// Version du crate (lisible, via Cargo).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prélude de confort pour les crates consommateurs (`raven-compiler`, `raven-vm`).
pub mod prelude {
    pub use crate::{
        bytecode::{Chunk, Op},
        error::{CoreError, Result},
        gc::Heap,
        object::{ClosureObj, FunctionProto, NativeCtx, NativeFn, NativeFnObj, ObjKind, ObjRef, Object, UpvalueDesc, UpvalueState},
        table::Table,
        value::{display_value, format_number, Value},
        FRAMES_LIMIT, STACK_SIZE,
    };
}
