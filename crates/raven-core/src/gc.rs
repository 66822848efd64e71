//! gc.rs — allocateur et collecteur "mark-sweep" traçant (§4.1).
//!
//! Toute la mémoire du tas Raven passe par ce module : une arène
//! `Vec<Option<Object>>` tient lieu de "liste intrusive" (§3) — libérer un
//! objet consiste à vider son emplacement et le renvoyer à la liste libre,
//! ce qui évite tout pointeur brut tout en conservant la même politique de
//! réutilisation qu'un allocateur par liste chaînée. `bytes_allocated` est
//! une estimation de la taille logique des objets vivants (et non de la
//! taille de l'arène Rust elle-même), pour que le déclenchement du GC
//! suive la même courbe que l'allocateur C original.

use crate::object::{fnv1a_32, ClosureObj, FunctionProto, NativeFnObj, Object, ObjKind, ObjRef, RavenString, UpvalueState};
use crate::table::Table;
use crate::value::Value;

/// Facteur de croissance du seuil de déclenchement (`next_gc := bytes × GROWTH_FACTOR`).
pub const GROWTH_FACTOR: usize = 2;

/// Seuil initial avant la première collecte (1 MiB, comme l'implémentation
/// C de référence).
pub const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

enum Slot {
    Free { next_free: Option<u32> },
    Used { object: Object, marked: bool, size: usize },
}

/// Case du pool d'internement : même conception à adressage ouvert que
/// [`crate::table::Table`] (§4.2), tombstones comprises — un bucket vidé
/// d'un `None` romprait la chaîne de sondage de tout synonyme de hachage
/// inséré après lui, le rendant introuvable et causant un second
/// internement du même contenu.
enum InternSlot {
    Empty,
    Tombstone,
    Occupied { hash: u32, slot: ObjRef },
}

/// Tas partagé d'une VM : arène d'objets, pool de chaînes internées,
/// comptabilité octets/seuil GC.
pub struct Heap {
    objects: Vec<Slot>,
    free_head: Option<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjRef>,
    intern: Vec<InternSlot>,
    intern_len: usize,
    intern_tombstones: usize,
    /// Mode debug : collecte à chaque allocation (§4.1 — "debug mode
    /// triggers GC on every growth").
    pub stress_gc: bool,
    /// Compteur de suppressions imbriquées (`import` désactive le GC le
    /// temps de faire partager l'allocateur à un sandbox — §4.6).
    suppress: u32,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Tas vide, prêt à allouer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            free_head: None,
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            gray: Vec::new(),
            intern: Vec::new(),
            intern_len: 0,
            intern_tombstones: 0,
            stress_gc: false,
            suppress: 0,
        }
    }

    /// Octets actuellement comptabilisés comme vivants.
    #[must_use]
    pub const fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Seuil au-delà duquel la prochaine allocation déclenche une collecte.
    #[must_use]
    pub const fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// Désactive temporairement le déclenchement du GC (réentrance `import`,
    /// §4.6). Les suppressions s'empilent ; le GC reste désactivé tant
    /// qu'au moins une est active.
    pub fn suppress_gc(&mut self) {
        self.suppress += 1;
    }

    /// Inverse de [`Self::suppress_gc`].
    pub fn unsuppress_gc(&mut self) {
        self.suppress = self.suppress.saturating_sub(1);
    }

    fn approx_size(object: &Object) -> usize {
        match object {
            Object::Str(s) => std::mem::size_of::<RavenString>() + s.data.len(),
            Object::Pair(..) => std::mem::size_of::<Value>() * 2,
            Object::Array(a) => std::mem::size_of::<Value>() * a.capacity(),
            Object::Map(_) => 64, // estimation: la table gère sa propre croissance
            Object::Function(_) => std::mem::size_of::<FunctionProto>(),
            Object::Upvalue(_) => std::mem::size_of::<UpvalueState>(),
            Object::Closure(c) => std::mem::size_of::<ClosureObj>() + c.upvalues.len() * 4,
            Object::Native(_) => std::mem::size_of::<NativeFnObj>(),
        }
    }

    /// Point de sûreté GC générique : tout appelant qui alloue un nouvel
    /// objet passe par ici. `mark_roots` permet de déclencher une collecte
    /// avant l'insertion si le seuil est dépassé (§4.1 — "every public
    /// object-creating primitive ... may trigger a GC before returning").
    fn insert(&mut self, object: Object, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        let size = Self::approx_size(&object);
        self.bytes_allocated += size;

        if (self.stress_gc || self.bytes_allocated >= self.next_gc) && self.suppress == 0 {
            self.collect_garbage(mark_roots);
        }

        let idx = match self.free_head {
            Some(i) => {
                let slot = &mut self.objects[i as usize];
                self.free_head = match slot {
                    Slot::Free { next_free } => *next_free,
                    Slot::Used { .. } => unreachable!("free list points at a used slot"),
                };
                *slot = Slot::Used { object, marked: false, size };
                i
            }
            None => {
                self.objects.push(Slot::Used { object, marked: false, size });
                (self.objects.len() - 1) as u32
            }
        };
        ObjRef(idx)
    }

    /// Alloue une chaîne, en réutilisant l'objet interné existant si le
    /// contenu est déjà connu (§4.2). C'est le point d'entrée unique pour
    /// produire des `Value::Object` de type chaîne : appeler directement
    /// `insert(Object::Str(..))` romprait l'invariant d'internement.
    pub fn intern(&mut self, s: &str, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        let hash = fnv1a_32(s.as_bytes());
        if let Some(existing) = self.find_interned(hash, s) {
            return existing;
        }
        let obj = self.insert(
            Object::Str(RavenString { hash, data: s.into() }),
            mark_roots,
        );
        self.intern_insert(hash, obj);
        obj
    }

    fn find_interned(&self, hash: u32, s: &str) -> Option<ObjRef> {
        if self.intern.is_empty() {
            return None;
        }
        let cap = self.intern.len();
        let mut idx = (hash as usize) & (cap - 1);
        loop {
            match &self.intern[idx] {
                InternSlot::Empty => return None,
                InternSlot::Tombstone => {}
                InternSlot::Occupied { hash: h, slot } if *h == hash && self.string_of(*slot) == s => {
                    return Some(*slot)
                }
                InternSlot::Occupied { .. } => {}
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    fn intern_insert(&mut self, hash: u32, obj: ObjRef) {
        let used = self.intern_len + self.intern_tombstones + 1;
        if self.intern.is_empty() || used as f64 > self.intern.len() as f64 * 0.75 {
            self.grow_intern();
        }
        let cap = self.intern.len();
        let mut idx = (hash as usize) & (cap - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.intern[idx] {
                InternSlot::Empty => break,
                InternSlot::Tombstone if first_tombstone.is_none() => first_tombstone = Some(idx),
                _ => {}
            }
            idx = (idx + 1) & (cap - 1);
        }
        let target = first_tombstone.unwrap_or(idx);
        if matches!(self.intern[target], InternSlot::Tombstone) {
            self.intern_tombstones -= 1;
        }
        self.intern[target] = InternSlot::Occupied { hash, slot: obj };
        self.intern_len += 1;
    }

    fn grow_intern(&mut self) {
        let new_cap = (self.intern.len() * 2).max(8);
        let old = std::mem::replace(&mut self.intern, (0..new_cap).map(|_| InternSlot::Empty).collect());
        self.intern_len = 0;
        self.intern_tombstones = 0;
        for slot in old {
            if let InternSlot::Occupied { hash, slot } = slot {
                self.intern_insert(hash, slot);
            }
        }
    }

    /// Retire du pool d'internement toute entrée dont la chaîne n'est plus
    /// marquée (§4.1 — fixup faible exécuté juste avant le sweep, sans
    /// quoi la table garderait une poignée pendante vers un objet libéré).
    fn weak_fixup_interned(&mut self) {
        for i in 0..self.intern.len() {
            let drop_it = match &self.intern[i] {
                InternSlot::Occupied { slot, .. } => !self.is_marked(*slot),
                _ => false,
            };
            if drop_it {
                self.intern[i] = InternSlot::Tombstone;
                self.intern_len -= 1;
                self.intern_tombstones += 1;
            }
        }
    }

    fn is_marked(&self, r: ObjRef) -> bool {
        matches!(self.objects[r.index()], Slot::Used { marked: true, .. })
    }

    fn string_of(&self, r: ObjRef) -> &str {
        match &self.objects[r.index()] {
            Slot::Used { object: Object::Str(s), .. } => s.as_str(),
            _ => unreachable!("interned handle does not point at a string"),
        }
    }

    /// Lit l'objet derrière une poignée.
    #[must_use]
    pub fn get(&self, r: ObjRef) -> &Object {
        match &self.objects[r.index()] {
            Slot::Used { object, .. } => object,
            Slot::Free { .. } => panic!("dangling ObjRef {r:?}: slot has been freed"),
        }
    }

    /// Lit mutablement l'objet derrière une poignée.
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        match &mut self.objects[r.index()] {
            Slot::Used { object, .. } => object,
            Slot::Free { .. } => panic!("dangling ObjRef {r:?}: slot has been freed"),
        }
    }

    /// Nom de type d'une valeur objet (pour les messages d'erreur runtime).
    #[must_use]
    pub fn type_name(&self, r: ObjRef) -> &'static str {
        self.get(r).kind().type_repr()
    }

    // ---------------- Primitives d'allocation publiques (§4.1 roots) ----------------

    /// Alloue une paire `(head . tail)`.
    pub fn alloc_pair(&mut self, head: Value, tail: Value, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.insert(Object::Pair(head, tail), mark_roots)
    }

    /// Alloue un tableau à partir d'un vecteur déjà construit.
    pub fn alloc_array(&mut self, values: Vec<Value>, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.insert(Object::Array(values), mark_roots)
    }

    /// Alloue une table associative vide.
    pub fn alloc_map(&mut self, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.insert(Object::Map(Table::new()), mark_roots)
    }

    /// Alloue un prototype de fonction compilé.
    pub fn alloc_function(&mut self, proto: FunctionProto, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.insert(Object::Function(proto), mark_roots)
    }

    /// Alloue une fermeture.
    pub fn alloc_closure(&mut self, closure: ClosureObj, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.insert(Object::Closure(closure), mark_roots)
    }

    /// Alloue une upvalue ouverte sur le slot de pile `stack_index`.
    pub fn alloc_upvalue(&mut self, stack_index: usize, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.insert(Object::Upvalue(UpvalueState::Open(stack_index)), mark_roots)
    }

    /// Enregistre une fonction native.
    pub fn alloc_native(&mut self, native: NativeFnObj, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.insert(Object::Native(native), mark_roots)
    }

    // ---------------------------- Mark / blacken / sweep ----------------------------

    /// Marque une valeur comme vivante ; si c'est un objet nouvellement
    /// marqué, il est ajouté à la pile grise pour être noirci plus tard.
    pub fn mark_value(&mut self, v: Value) {
        if let Value::Object(r) = v {
            self.mark_object(r);
        }
    }

    /// Marque un objet par poignée.
    pub fn mark_object(&mut self, r: ObjRef) {
        let already = match &mut self.objects[r.index()] {
            Slot::Used { marked, .. } => std::mem::replace(marked, true),
            Slot::Free { .. } => return,
        };
        if !already {
            self.gray.push(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        // `unsafe`-free traversal: on copie/clone les sous-valeurs qu'on
        // doit marquer avant de les marquer, pour ne jamais tenir un
        // emprunt sur `self.objects` en même temps qu'un appel à
        // `self.mark_*`.
        enum Children {
            None,
            Two(Value, Value),
            Many(Vec<Value>),
            MapKeys(Vec<(ObjRef, Value)>),
            Closure(ObjRef, Vec<ObjRef>),
            FunctionConsts(Vec<Value>, Option<ObjRef>),
            UpvalueClosed(Value),
        }

        let children = match self.get(r) {
            Object::Str(_) | Object::Native(_) => Children::None,
            Object::Pair(h, t) => Children::Two(*h, *t),
            Object::Array(a) => Children::Many(a.clone()),
            Object::Map(m) => Children::MapKeys(m.iter().map(|(k, v)| (k, *v)).collect()),
            Object::Closure(c) => Children::Closure(c.function, c.upvalues.clone()),
            Object::Function(f) => {
                Children::FunctionConsts(f.chunk.consts().to_vec(), f.name)
            }
            Object::Upvalue(UpvalueState::Closed(v)) => Children::UpvalueClosed(*v),
            Object::Upvalue(UpvalueState::Open(_)) => Children::None,
        };

        match children {
            Children::None => {}
            Children::Two(a, b) => {
                self.mark_value(a);
                self.mark_value(b);
            }
            Children::Many(vs) => {
                for v in vs {
                    self.mark_value(v);
                }
            }
            Children::MapKeys(entries) => {
                for (k, v) in entries {
                    self.mark_object(k);
                    self.mark_value(v);
                }
            }
            Children::Closure(func, ups) => {
                self.mark_object(func);
                for u in ups {
                    self.mark_object(u);
                }
            }
            Children::FunctionConsts(consts, name) => {
                for c in consts {
                    self.mark_value(c);
                }
                if let Some(n) = name {
                    self.mark_object(n);
                }
            }
            Children::UpvalueClosed(v) => self.mark_value(v),
        }
    }

    /// Cycle complet mark-sweep. `mark_roots` doit appeler
    /// [`Self::mark_value`]/[`Self::mark_object`] pour chaque racine (pile
    /// de valeurs, fermetures des frames, upvalues ouvertes, globales,
    /// registre `X`) — ces racines vivent côté `raven-vm`, ce module ne les
    /// connaît pas.
    pub fn collect_garbage(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        mark_roots(self);

        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }

        self.weak_fixup_interned();
        self.sweep();

        self.next_gc = self.bytes_allocated * GROWTH_FACTOR;
    }

    fn sweep(&mut self) {
        let mut reclaimed = 0usize;
        for i in 0..self.objects.len() {
            match &mut self.objects[i] {
                Slot::Used { marked, .. } if *marked => {
                    *marked = false;
                }
                Slot::Used { size, .. } => {
                    reclaimed += *size;
                    self.objects[i] = Slot::Free { next_free: self.free_head };
                    self.free_head = Some(i as u32);
                }
                Slot::Free { .. } => {}
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(reclaimed);
    }

    /// Nombre d'objets vivants (pour les tests/diagnostics).
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.objects.iter().filter(|s| matches!(s, Slot::Used { .. })).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn interning_is_deduplicated() {
        let mut heap = Heap::new();
        let a = heap.intern("hello", |_| {});
        let b = heap.intern("hello", |_| {});
        let c = heap.intern("world", |_| {});
        assert_eq!(a, b, "same content must yield the same handle");
        assert_ne!(a, c);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        let a = heap.alloc_pair(Value::Number(1.0), Value::Nil, |_| {});
        drop(a);
        let before = heap.live_count();
        heap.collect_garbage(|_| {}); // aucune racine marquée -> tout meurt
        assert!(heap.live_count() < before);
    }

    #[test]
    fn marked_roots_survive_collection() {
        let mut heap = Heap::new();
        let s = heap.intern("kept", |_| {});
        heap.collect_garbage(|h| h.mark_object(s));
        assert_eq!(heap.string_of(s), "kept");
    }

    #[test]
    fn cyclic_pair_is_collected_without_leak() {
        let mut heap = Heap::new();
        let a = heap.alloc_pair(Value::Nil, Value::Nil, |_| {});
        let b = heap.alloc_pair(Value::Object(a), Value::Nil, |_| {});
        if let Object::Pair(head, _) = heap.get_mut(a) {
            *head = Value::Object(b);
        }
        heap.collect_garbage(|_| {});
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn stress_gc_runs_every_allocation() {
        let mut heap = Heap::new();
        heap.stress_gc = true;
        for i in 0..50 {
            heap.intern(&format!("s{i}"), |_| {});
        }
        // Ne doit pas paniquer ; rien n'est marqué donc tout est
        // potentiellement récupéré entre deux allocations.
        assert!(heap.live_count() <= 50);
    }

    proptest! {
        /// §3/§8 interning invariant, after a collection that frees some but
        /// not all interned strings: re-interning a still-live string must
        /// return its existing handle, never a fresh duplicate. Regression
        /// guard for the weak-fixup bug where a dropped entry was written as
        /// `None` instead of a tombstone, severing the probe chain of any
        /// surviving synonym inserted after it.
        #[test]
        fn interning_survives_partial_collection(
            entries in proptest::collection::vec(("[a-z]{1,6}", any::<bool>()), 2..60)
        ) {
            let mut heap = Heap::new();
            let handles: Vec<ObjRef> = entries.iter().map(|(s, _)| heap.intern(s, |_| {})).collect();
            heap.collect_garbage(|h| {
                for ((_, keep), &r) in entries.iter().zip(handles.iter()) {
                    if *keep {
                        h.mark_object(r);
                    }
                }
            });
            for ((s, keep), &r) in entries.iter().zip(handles.iter()) {
                if *keep {
                    let again = heap.intern(s, |_| {});
                    prop_assert_eq!(again, r);
                }
            }
        }
    }
}
