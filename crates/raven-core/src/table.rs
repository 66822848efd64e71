//! table.rs — table de hachage à adressage ouvert, clé = chaîne internée.
//!
//! §4.2 : la même conception de table (adressage ouvert, sondage linéaire,
//! tombstones, capacité puissance de deux, facteur de charge ≤ 0.75) sert
//! pour le pool de chaînes internées, les globales de la VM et les objets
//! `Map`. Ce module fournit la structure générique réutilisée par ces deux
//! derniers usages ; le pool d'internement lui-même vit dans
//! [`crate::gc::Heap`] car il doit comparer des octets bruts avant qu'un
//! [`crate::object::ObjRef`] n'existe (voir `Heap::intern`).

use crate::object::ObjRef;

const LOAD_FACTOR_CEILING: f64 = 0.75;

#[derive(Clone)]
enum Slot<V> {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, hash: u32, value: V },
}

/// Table associative `ObjRef (chaîne internée) -> V`.
///
/// L'égalité de clé est une simple comparaison de poignée : comme les
/// chaînes sont internées (§3), deux poignées égales désignent
/// nécessairement le même contenu.
#[derive(Clone)]
pub struct Table<V> {
    slots: Vec<Slot<V>>,
    len: usize,
    tombstones: usize,
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Self { slots: Vec::new(), len: 0, tombstones: 0 }
    }
}

impl<V: Clone> Table<V> {
    /// Table vide.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Nombre d'entrées vivantes (hors tombstones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` si aucune entrée vivante.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn find_slot(slots: &[Slot<V>], key: ObjRef, hash: u32) -> usize {
        debug_assert!(!slots.is_empty());
        let cap = slots.len();
        let mut idx = (hash as usize) & (cap - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &slots[idx] {
                Slot::Empty => return first_tombstone.unwrap_or(idx),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Occupied { key: k, .. } if *k == key => return idx,
                Slot::Occupied { .. } => {}
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let new_capacity = new_capacity.next_power_of_two().max(8);
        let mut new_slots: Vec<Slot<V>> = (0..new_capacity).map(|_| Slot::Empty).collect();
        let mut live = 0;
        for slot in std::mem::take(&mut self.slots) {
            if let Slot::Occupied { key, hash, value } = slot {
                let idx = Self::find_slot(&new_slots, key, hash);
                new_slots[idx] = Slot::Occupied { key, hash, value };
                live += 1;
            }
        }
        self.slots = new_slots;
        self.len = live;
        self.tombstones = 0;
    }

    fn ensure_capacity_for_insert(&mut self) {
        if self.slots.is_empty() {
            self.grow(8);
            return;
        }
        // Tombstones comptent contre le facteur de charge (ils ralentissent
        // le sondage) : on regrossit dès que occupés+tombstones dépasse 0.75.
        let used = self.len + self.tombstones + 1;
        if (used as f64) > (self.capacity() as f64) * LOAD_FACTOR_CEILING {
            self.grow(self.capacity() * 2);
        }
    }

    /// Lit la valeur associée à `key`, si présente.
    #[must_use]
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<&V> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = Self::find_slot(&self.slots, key, hash);
        match &self.slots[idx] {
            Slot::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Définit `key -> value`. Retourne `true` si `key` était une nouvelle clé.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: V) -> bool {
        self.ensure_capacity_for_insert();
        let idx = Self::find_slot(&self.slots, key, hash);
        let is_new = !matches!(self.slots[idx], Slot::Occupied { .. });
        let was_tombstone = matches!(self.slots[idx], Slot::Tombstone);
        self.slots[idx] = Slot::Occupied { key, hash, value };
        if is_new {
            self.len += 1;
            if was_tombstone {
                self.tombstones -= 1;
            }
        }
        is_new
    }

    /// Supprime `key`, renvoie l'ancienne valeur si elle existait.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> Option<V> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = Self::find_slot(&self.slots, key, hash);
        match std::mem::replace(&mut self.slots[idx], Slot::Tombstone) {
            Slot::Occupied { value, .. } => {
                self.len -= 1;
                self.tombstones += 1;
                Some(value)
            }
            other => {
                self.slots[idx] = other;
                None
            }
        }
    }

    /// `true` si `key` existe, sans déréférencer `V`.
    #[must_use]
    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Itère les paires `(ObjRef, &V)` vivantes — ordre non spécifié.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &V)> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied { key, value, .. } => Some((*key, value)),
            _ => None,
        })
    }

    /// Itère mutablement les valeurs vivantes (pour le marquage GC).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjRef, &mut V)> {
        self.slots.iter_mut().filter_map(|s| match s {
            Slot::Occupied { key, value, .. } => Some((*key, value)),
            _ => None,
        })
    }

    /// Retire toute entrée dont la clé n'est plus marquée vivante (§4.1 —
    /// fixup faible de l'interner ; réutilisé tel quel ici pour les maps
    /// qui, elles, n'ont normalement rien à purger puisque leurs clés sont
    /// marquées via [`Object::kind`] avant le sweep).
    pub fn retain_keys(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for slot in &mut self.slots {
            if let Slot::Occupied { key, .. } = slot {
                if !keep(*key) {
                    *slot = Slot::Tombstone;
                    self.len -= 1;
                    self.tombstones += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn oref(i: u32) -> ObjRef {
        // Les tests de ce module n'ont pas besoin d'un vrai tas : `ObjRef`
        // est un simple index, on peut en fabriquer directement ici via le
        // constructeur `pub(crate)` (même crate).
        ObjRef(i)
    }

    #[test]
    fn insert_get_delete_roundtrip() {
        let mut t: Table<i64> = Table::new();
        assert!(t.set(oref(1), 111, 10));
        assert!(t.set(oref(2), 222, 20));
        assert!(!t.set(oref(1), 111, 99)); // mise à jour, pas une nouvelle clé
        assert_eq!(t.get(oref(1), 111), Some(&99));
        assert_eq!(t.get(oref(2), 222), Some(&20));
        assert_eq!(t.len(), 2);

        assert_eq!(t.delete(oref(1), 111), Some(99));
        assert_eq!(t.get(oref(1), 111), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t: Table<i64> = Table::new();
        for i in 0..200u32 {
            t.set(oref(i), i, i64::from(i));
        }
        assert_eq!(t.len(), 200);
        for i in 0..200u32 {
            assert_eq!(t.get(oref(i), i), Some(&i64::from(i)));
        }
    }

    #[test]
    fn tombstones_do_not_break_probing() {
        let mut t: Table<i64> = Table::new();
        for i in 0..8u32 {
            t.set(oref(i), i, i64::from(i));
        }
        t.delete(oref(3), 3);
        t.delete(oref(4), 4);
        // La clé 5 doit rester trouvable même si les tombstones 3,4 sont
        // entre son bucket naturel et sa position réelle après collisions.
        assert_eq!(t.get(oref(5), 5), Some(&5));
        assert!(t.set(oref(9), 9, 90)); // réutilise un slot tombstone
        assert_eq!(t.get(oref(9), 9), Some(&90));
    }
}
