//! value.rs — le type `Value` de la VM Raven.
//!
//! Union étiquetée portable : nombre, booléen, nil, ou référence vers un
//! objet du tas ([`ObjRef`]). Pas de NaN-boxing ici — le crate (comme tout
//! le reste du workspace) compile sous `#![forbid(unsafe_code)]`, et le
//! NaN-boxing exige des transmutations de bits qu'on ne peut pas exprimer
//! sans `unsafe`. `Value` reste donc un `enum` classique, `Copy`, 16 octets
//! sur la plupart des plateformes — l'identité sémantique décrite par la
//! spec est préservée quelle que soit la représentation bas niveau choisie.

use crate::object::ObjRef;
use std::fmt;

/// Valeur dynamique manipulée par le compilateur et la VM.
#[derive(Clone, Copy, PartialEq)]
pub enum Value {
    /// `nil`.
    Nil,
    /// Booléen.
    Bool(bool),
    /// Nombre flottant double précision (unique type numérique du langage).
    Number(f64),
    /// Référence vers un objet géré par le tas ([`crate::gc::Heap`]).
    Object(ObjRef),
}

impl Value {
    /// Tout sauf `nil` et `false` est *truthy* (§4.5 — `0`, `""`, `[]`, `{}` compris).
    #[must_use]
    pub const fn is_truthy(self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// `true` si la valeur est un nombre.
    #[must_use]
    pub const fn is_number(self) -> bool {
        matches!(self, Value::Number(_))
    }

    /// Extrait le nombre porté, si c'en est un.
    #[must_use]
    pub const fn as_number(self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Extrait la référence objet portée, si c'en est une.
    #[must_use]
    pub const fn as_object(self) -> Option<ObjRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Nom du type, pour les messages d'erreur runtime (`type_repr` côté C original).
    #[must_use]
    pub fn type_name(self, heap: &crate::gc::Heap) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Object(o) => heap.type_name(o),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Object(o) => write!(f, "<object {:?}>", o),
        }
    }
}

/// Formate un nombre comme `%g` le ferait (§4.5 — concaténation).
///
/// `printf("%g", x)` choisit la représentation la plus courte entre notation
/// fixe et scientifique ; Rust n'a pas d'équivalent direct, donc on
/// retombe sur l'affichage par défaut de `f64`, qui coïncide avec `%g`
/// pour l'immense majorité des valeurs rencontrées par un script (entiers
/// exacts et décimales simples) tout en restant correctement arrondi.
#[must_use]
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n.is_sign_positive() { "inf".to_string() } else { "-inf".to_string() }
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Représentation textuelle d'une valeur pour `@` et `print`/`println`
/// (§4.5 — nombres en `%g`, booléens `true`/`false`, `nil`, chaînes brutes,
/// "une forme de débogage raisonnable" pour le reste).
#[must_use]
pub fn display_value(heap: &crate::gc::Heap, v: Value) -> String {
    use crate::object::Object;
    match v {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(n),
        Value::Object(r) => match heap.get(r) {
            Object::Str(s) => s.as_str().to_string(),
            Object::Pair(h, t) => {
                format!("({} . {})", display_value(heap, *h), display_value(heap, *t))
            }
            Object::Array(a) => {
                let items: Vec<String> = a.iter().map(|v| display_value(heap, *v)).collect();
                format!("[{}]", items.join(", "))
            }
            Object::Map(m) => {
                let items: Vec<String> = m
                    .iter()
                    .map(|(k, v)| {
                        let key = match heap.get(k) {
                            Object::Str(s) => s.as_str().to_string(),
                            _ => "?".to_string(),
                        };
                        format!("{key}: {}", display_value(heap, *v))
                    })
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            Object::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", display_value(heap, Value::Object(n))),
                None => "<fn>".to_string(),
            },
            Object::Closure(c) => display_value(heap, Value::Object(c.function)),
            Object::Upvalue(_) => "<upvalue>".to_string(),
            Object::Native(n) => format!("<native {}>", n.name),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_spec() {
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Nil.is_truthy());
    }

    #[test]
    fn number_formatting_is_compact() {
        assert_eq!(format_number(14.0), "14");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(-3.0), "-3");
    }
}
