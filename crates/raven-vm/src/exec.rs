//! exec.rs — pile de valeurs, frames d'appel et boucle de dispatch (§4.5).
//!
//! `ExecState` porte tout ce qui est *par exécution* (pile, frames, upvalues
//! ouvertes, globales, registre X) ; `Heap` (raven-core) reste le seul
//! possesseur de la mémoire. Les fonctions de ce module prennent les deux en
//! paramètres disjoints plutôt que comme champs d'une même struct : les
//! fermetures `mark_roots` passées au tas n'ont ainsi jamais besoin d'une
//! double prise sur un même `&mut` (§4.1 — "every public object-creating
//! primitive ... may trigger a GC before returning").

use std::io::Write;

use raven_core::bytecode::Op;
use raven_core::object::{ClosureObj, NativeFn, Object, UpvalueState};
use raven_core::table::Table;
use raven_core::{display_value, Heap, ObjRef, Value, FRAMES_LIMIT, STACK_SIZE};

use crate::error::{RuntimeError, TraceEntry};
use crate::natives::install_natives;

/// Frame d'appel (§3) : fermeture active, instruction pointer, base de pile.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: ObjRef,
    pub ip: u32,
    pub base: usize,
}

/// Tout l'état "par exécution" d'une VM Raven : pile de valeurs, pile de
/// frames, upvalues ouvertes, globales, registre X, fichier courant (pour
/// les diagnostics). Le tas ([`Heap`]) est géré séparément.
pub struct ExecState {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Upvalues ouvertes, triées par adresse de pile décroissante (§3,
    /// invariant 1).
    pub open_upvalues: Vec<ObjRef>,
    pub globals: Table<Value>,
    /// Registre X (§4.6) : valeur de la dernière expression de haut niveau.
    pub x_register: Value,
    /// `false` le temps d'un sandbox `import` (§4.5 "Exit").
    pub reset_on_exit: bool,
    /// Fichier source courant, pour les diagnostics (§7).
    pub current_file: String,
}

impl ExecState {
    /// État d'exécution neuf, globales déjà peuplées des natives (§6).
    pub fn new(heap: &mut Heap, file: impl Into<String>) -> Self {
        let mut globals = Table::new();
        install_natives(heap, &mut globals);
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            open_upvalues: Vec::new(),
            globals,
            x_register: Value::Nil,
            reset_on_exit: true,
            current_file: file.into(),
        }
    }
}

/// Marque toutes les racines GC connues de la VM (§4.1) : pile de valeurs,
/// fermetures des frames, upvalues ouvertes, globales (clé *et* valeur —
/// la clé est un nom de variable interné, elle doit survivre tant que la
/// globale existe), et le registre X.
pub fn mark_roots(
    heap: &mut Heap,
    stack: &[Value],
    frames: &[CallFrame],
    globals: &Table<Value>,
    open_upvalues: &[ObjRef],
    x_register: Value,
) {
    for v in stack {
        heap.mark_value(*v);
    }
    for f in frames {
        heap.mark_object(f.closure);
    }
    for (k, v) in globals.iter() {
        heap.mark_object(k);
        heap.mark_value(*v);
    }
    for u in open_upvalues {
        heap.mark_object(*u);
    }
    heap.mark_value(x_register);
}

/// Enveloppe un prototype de fonction compilé dans une fermeture à zéro
/// upvalue (script top-level ou module `import` — aucun des deux n'a
/// d'englobante qui lui capture quoi que ce soit, §4.4).
pub fn wrap_toplevel_closure(heap: &mut Heap, state: &ExecState, function: ObjRef) -> ObjRef {
    let mark = |h: &mut Heap| {
        mark_roots(h, &state.stack, &state.frames, &state.globals, &state.open_upvalues, state.x_register)
    };
    heap.alloc_closure(ClosureObj { function, upvalues: Vec::new() }, mark)
}

fn proto_arity(heap: &Heap, function: ObjRef) -> u8 {
    match heap.get(function) {
        Object::Function(f) => f.arity,
        _ => 0,
    }
}

fn function_name(heap: &Heap, function: ObjRef) -> String {
    match heap.get(function) {
        Object::Function(f) => match f.name {
            Some(n) => match heap.get(n) {
                Object::Str(s) => s.as_str().to_string(),
                _ => "<fn>".to_string(),
            },
            None => "<toplevel>".to_string(),
        },
        _ => "<fn>".to_string(),
    }
}

fn current_line(heap: &Heap, frame: &CallFrame) -> u32 {
    let Object::Closure(c) = heap.get(frame.closure) else { return 0 };
    let Object::Function(f) = heap.get(c.function) else { return 0 };
    f.chunk.line_for_pc(frame.ip.saturating_sub(1)).unwrap_or(0)
}

fn build_trace(heap: &Heap, state: &ExecState) -> Vec<TraceEntry> {
    state
        .frames
        .iter()
        .rev()
        .map(|f| {
            let Object::Closure(c) = heap.get(f.closure) else {
                return TraceEntry { file: state.current_file.clone(), line: 0, function: "<fn>".to_string() };
            };
            TraceEntry {
                file: state.current_file.clone(),
                line: current_line(heap, f),
                function: function_name(heap, c.function),
            }
        })
        .collect()
}

fn runtime_error(heap: &Heap, state: &ExecState, message: impl Into<String>) -> RuntimeError {
    let line = state.frames.last().map(|f| current_line(heap, f)).unwrap_or(0);
    RuntimeError {
        file: state.current_file.clone(),
        line,
        message: message.into(),
        trace: build_trace(heap, state),
    }
}

fn fetch_op(heap: &Heap, frame: &CallFrame) -> Option<Op> {
    let Object::Closure(c) = heap.get(frame.closure) else { return None };
    let Object::Function(f) = heap.get(c.function) else { return None };
    f.chunk.op(frame.ip).cloned()
}

fn const_at(heap: &Heap, frame: &CallFrame, idx: u8) -> Value {
    let Object::Closure(c) = heap.get(frame.closure) else { unreachable!() };
    let Object::Function(f) = heap.get(c.function) else { unreachable!() };
    f.chunk.const_at(idx).expect("compiler only ever emits valid constant indices")
}

fn string_hash(heap: &Heap, r: ObjRef) -> u32 {
    match heap.get(r) {
        Object::Str(s) => s.hash(),
        _ => unreachable!("global/key names are always interned strings"),
    }
}

fn string_content(heap: &Heap, r: ObjRef) -> String {
    match heap.get(r) {
        Object::Str(s) => s.as_str().to_string(),
        _ => String::new(),
    }
}

/// Capture (ou réutilise) une upvalue ouverte sur le slot de pile `index`
/// (§4.4 — `resolve_upvalue`/`add_upvalue`, §3 — invariants 1 et 2). Prend
/// les champs de l'état d'exécution un par un (plutôt qu'un `&ExecState`
/// entier) pour que l'appelant puisse passer `&mut state.open_upvalues` en
/// même temps que les autres champs par projection directe de champ.
fn capture_upvalue(
    heap: &mut Heap,
    stack: &[Value],
    frames: &[CallFrame],
    globals: &Table<Value>,
    x_register: Value,
    open_upvalues: &mut Vec<ObjRef>,
    index: usize,
) -> ObjRef {
    let mut insert_at = open_upvalues.len();
    for (i, &u) in open_upvalues.iter().enumerate() {
        match heap.get(u) {
            Object::Upvalue(UpvalueState::Open(slot)) => {
                if *slot == index {
                    return u;
                }
                if *slot < index {
                    insert_at = i;
                    break;
                }
            }
            _ => unreachable!("open_upvalues must only hold Open upvalues"),
        }
    }
    let mark = |h: &mut Heap| mark_roots(h, stack, frames, globals, open_upvalues, x_register);
    let created = heap.alloc_upvalue(index, mark);
    open_upvalues.insert(insert_at, created);
    created
}

/// Ferme toutes les upvalues ouvertes dont le slot est `>= from` (§3,
/// invariant 3) : copie la valeur de pile dans `captured`.
fn close_upvalues_from(heap: &mut Heap, open_upvalues: &mut Vec<ObjRef>, stack: &[Value], from: usize) {
    while let Some(&u) = open_upvalues.first() {
        let slot = match heap.get(u) {
            Object::Upvalue(UpvalueState::Open(slot)) => *slot,
            _ => unreachable!("open_upvalues must only hold Open upvalues"),
        };
        if slot < from {
            break;
        }
        open_upvalues.remove(0);
        let value = stack[slot];
        if let Object::Upvalue(s) = heap.get_mut(u) {
            *s = UpvalueState::Closed(value);
        }
    }
}

fn push(heap: &Heap, state: &mut ExecState, v: Value) -> Result<(), RuntimeError> {
    if state.stack.len() >= STACK_SIZE {
        return Err(runtime_error(heap, state, "stack overflow"));
    }
    state.stack.push(v);
    Ok(())
}

fn pop(heap: &Heap, state: &mut ExecState) -> Result<Value, RuntimeError> {
    state.stack.pop().ok_or_else(|| runtime_error(heap, state, "stack underflow"))
}

/// Lit une valeur `back` emplacements sous le sommet sans la dépiler (§4.1 —
/// "Peek (not Pop) before Push(result)"). Utilisé par les sites
/// d'allocation dont les opérandes doivent rester racines GC (sur la pile)
/// jusqu'à ce que le nouvel objet les référence.
fn peek(heap: &Heap, state: &ExecState, back: usize) -> Result<Value, RuntimeError> {
    state
        .stack
        .len()
        .checked_sub(back + 1)
        .and_then(|i| state.stack.get(i).copied())
        .ok_or_else(|| runtime_error(heap, state, "stack underflow"))
}

fn array_index(heap: &Heap, state: &ExecState, index: Value, len: usize) -> Result<usize, RuntimeError> {
    let Some(n) = index.as_number() else {
        return Err(runtime_error(heap, state, "array index must be a number"));
    };
    if n.fract() != 0.0 || n < 0.0 || n >= len as f64 {
        return Err(runtime_error(heap, state, format!("array index {n} out of bounds (length {len})")));
    }
    Ok(n as usize)
}

fn index_get(heap: &Heap, state: &ExecState, collection: Value, index: Value) -> Result<Value, RuntimeError> {
    let Value::Object(r) = collection else {
        return Err(runtime_error(heap, state, "cannot index a non-collection value"));
    };
    match heap.get(r) {
        Object::Array(a) => {
            let i = array_index(heap, state, index, a.len())?;
            Ok(a[i])
        }
        Object::Map(m) => {
            let Value::Object(key_ref) = index else {
                return Err(runtime_error(heap, state, "map index must be a string"));
            };
            let hash = string_hash(heap, key_ref);
            Ok(m.get(key_ref, hash).copied().unwrap_or(Value::Nil))
        }
        _ => Err(runtime_error(heap, state, "cannot index this value")),
    }
}

fn index_set(
    heap: &mut Heap,
    state: &mut ExecState,
    collection: Value,
    index: Value,
    value: Value,
) -> Result<(), RuntimeError> {
    let Value::Object(r) = collection else {
        return Err(runtime_error(heap, state, "cannot index a non-collection value"));
    };
    match heap.get(r) {
        Object::Array(a) => {
            let i = array_index(heap, state, index, a.len())?;
            let Object::Array(a) = heap.get_mut(r) else { unreachable!() };
            a[i] = value;
            Ok(())
        }
        Object::Map(_) => {
            let Value::Object(key_ref) = index else {
                return Err(runtime_error(heap, state, "map index must be a string"));
            };
            let hash = string_hash(heap, key_ref);
            let Object::Map(m) = heap.get_mut(r) else { unreachable!() };
            m.set(key_ref, hash, value);
            Ok(())
        }
        _ => Err(runtime_error(heap, state, "cannot index this value")),
    }
}

/// Construit les globales fraîches d'un sandbox `import` (§4.6) : une
/// nouvelle table de noms, repeuplée des mêmes natives (le module importé
/// doit pouvoir appeler `print`, `import`, etc., exactement comme le
/// programme appelant).
fn fresh_sandbox_globals(heap: &mut Heap) -> Table<Value> {
    let mut globals = Table::new();
    install_natives(heap, &mut globals);
    globals
}

/// Exécute `import(path)` : compile et lance le fichier dans un contexte
/// partageant le tas mais avec ses propres globales (§4.6). La pile et la
/// pile de frames de l'appelant sont réutilisées telles quelles (la
/// fonction importée est poussée par-dessus) — c'est ce qui permet au GC
/// de continuer à voir l'intégralité de l'état vivant pendant le sandbox,
/// sans registre de racines séparé.
fn run_import(
    heap: &mut Heap,
    state: &mut ExecState,
    out: &mut dyn Write,
    path: &str,
) -> Result<Value, String> {
    let saved_globals = std::mem::replace(&mut state.globals, fresh_sandbox_globals(heap));
    let saved_x = state.x_register;
    let saved_reset = state.reset_on_exit;
    let saved_file = state.current_file.clone();
    state.x_register = Value::Nil;
    state.reset_on_exit = false;
    state.current_file = path.to_string();

    let outcome = (|| -> Result<(), String> {
        let proto = raven_compiler::compile_file(path, heap).map_err(|e| e.to_string())?;
        let closure = wrap_toplevel_closure(heap, state, proto);
        let target = state.frames.len();
        if state.frames.len() >= FRAMES_LIMIT {
            return Err("call stack overflows".to_string());
        }
        state.stack.push(Value::Object(closure));
        state.frames.push(CallFrame { closure, ip: 0, base: state.stack.len() - 1 });
        run_until(heap, state, out, target).map(|_| ()).map_err(|e| e.to_string())
    })();

    let exported = state.x_register;
    state.globals = saved_globals;
    state.x_register = saved_x;
    state.reset_on_exit = saved_reset;
    state.current_file = saved_file;

    outcome.map(|()| exported)
}

enum Callee {
    Closure(ObjRef),
    Native { name: &'static str, arity_min: u8, arity_max: u8, func: NativeFn },
}

/// Appelle la valeur assise à `stack[stack.len()-argc-1]` avec `argc`
/// arguments au sommet de pile (§4.5 — `OP_CALL`).
fn call_value(
    heap: &mut Heap,
    state: &mut ExecState,
    out: &mut dyn Write,
    argc: u8,
) -> Result<(), RuntimeError> {
    let argc = argc as usize;
    let callee_slot = state.stack.len() - argc - 1;
    let callee = state.stack[callee_slot];

    let Value::Object(callee_ref) = callee else {
        return Err(runtime_error(heap, state, "attempt to call a non-function value"));
    };

    let target = match heap.get(callee_ref) {
        Object::Closure(c) => Callee::Closure(c.function),
        Object::Native(n) => {
            Callee::Native { name: n.name, arity_min: n.arity_min, arity_max: n.arity_max, func: n.func }
        }
        _ => return Err(runtime_error(heap, state, "attempt to call a non-function value")),
    };

    match target {
        Callee::Closure(function) => {
            let arity = proto_arity(heap, function);
            if usize::from(arity) != argc {
                return Err(runtime_error(heap, state, format!("expected {arity} argument(s) but got {argc}")));
            }
            if state.frames.len() >= FRAMES_LIMIT {
                return Err(runtime_error(heap, state, "call stack overflows"));
            }
            state.frames.push(CallFrame { closure: callee_ref, ip: 0, base: callee_slot });
            Ok(())
        }
        Callee::Native { name, arity_min, arity_max, func } => {
            if argc < usize::from(arity_min) || argc > usize::from(arity_max) {
                return Err(runtime_error(
                    heap,
                    state,
                    format!("native '{name}' expected between {arity_min} and {arity_max} argument(s), got {argc}"),
                ));
            }
            let args: Vec<Value> = state.stack[callee_slot + 1..].to_vec();
            let mut import_cb = |h: &mut Heap, o: &mut dyn Write, path: &str| run_import(h, &mut *state, o, path);
            let result = {
                let mut ctx =
                    raven_core::object::NativeCtx { heap: &mut *heap, out: &mut *out, import: &mut import_cb };
                func(&mut ctx, &args)
            };
            match result {
                Ok(value) => {
                    state.stack.truncate(callee_slot);
                    state.stack.push(value);
                    Ok(())
                }
                Err(message) => Err(runtime_error(heap, state, message)),
            }
        }
    }
}

/// Boucle de dispatch fetch-decode-execute (§4.5). S'arrête et renvoie la
/// valeur de sommet de pile dès que `state.frames.len() == target` — pour
/// le programme principal `target == 0`; pour un sandbox `import`,
/// `target` est la profondeur de frames *avant* que le module importé n'y
/// ait été poussé, ce qui permet de ré-entrer ce même dispatcher de façon
/// synchrone et récursive (§4.6, §5).
pub fn run_until(
    heap: &mut Heap,
    state: &mut ExecState,
    out: &mut dyn Write,
    target: usize,
) -> Result<Value, RuntimeError> {
    loop {
        if state.frames.len() == target {
            return Ok(state.stack.last().copied().unwrap_or(Value::Nil));
        }

        let frame_idx = state.frames.len() - 1;
        let Some(op) = fetch_op(heap, &state.frames[frame_idx]) else {
            return Err(runtime_error(heap, state, "instruction pointer out of range"));
        };
        state.frames[frame_idx].ip += 1;

        match op {
            Op::PushTrue => push(heap, state, Value::Bool(true))?,
            Op::PushFalse => push(heap, state, Value::Bool(false))?,
            Op::PushNil => push(heap, state, Value::Nil)?,
            Op::PushConst(idx) => {
                let v = const_at(heap, &state.frames[frame_idx], idx);
                push(heap, state, v)?;
            }
            Op::PushX => push(heap, state, state.x_register)?,
            Op::SaveX => {
                state.x_register = pop(heap, state)?;
            }
            Op::Pop => {
                pop(heap, state)?;
            }
            Op::PopN(n) => {
                let new_len = state.stack.len().saturating_sub(usize::from(n));
                state.stack.truncate(new_len);
            }

            Op::Add => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => push(heap, state, Value::Number(x + y))?,
                    _ => return Err(runtime_error(heap, state, "operands must be numbers")),
                }
            }
            Op::Sub => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => push(heap, state, Value::Number(x - y))?,
                    _ => return Err(runtime_error(heap, state, "operands must be numbers")),
                }
            }
            Op::Mul => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => push(heap, state, Value::Number(x * y))?,
                    _ => return Err(runtime_error(heap, state, "operands must be numbers")),
                }
            }
            Op::Div => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => push(heap, state, Value::Number(x / y))?,
                    _ => return Err(runtime_error(heap, state, "operands must be numbers")),
                }
            }
            Op::Mod => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => push(heap, state, Value::Number(x % y))?,
                    _ => return Err(runtime_error(heap, state, "operands must be numbers")),
                }
            }
            Op::Lt => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => push(heap, state, Value::Bool(x < y))?,
                    _ => return Err(runtime_error(heap, state, "operands must be numbers")),
                }
            }
            Op::Ltq => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => push(heap, state, Value::Bool(x <= y))?,
                    _ => return Err(runtime_error(heap, state, "operands must be numbers")),
                }
            }
            Op::Gt => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => push(heap, state, Value::Bool(x > y))?,
                    _ => return Err(runtime_error(heap, state, "operands must be numbers")),
                }
            }
            Op::Gtq => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => push(heap, state, Value::Bool(x >= y))?,
                    _ => return Err(runtime_error(heap, state, "operands must be numbers")),
                }
            }
            Op::Eq => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                push(heap, state, Value::Bool(a == b))?;
            }
            Op::Neq => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                push(heap, state, Value::Bool(a != b))?;
            }

            Op::Neg => {
                let a = pop(heap, state)?;
                match a.as_number() {
                    Some(n) => push(heap, state, Value::Number(-n))?,
                    None => return Err(runtime_error(heap, state, "operand must be a number")),
                }
            }
            Op::Not => {
                let a = pop(heap, state)?;
                push(heap, state, Value::Bool(!a.is_truthy()))?;
            }

            Op::Concatenate => {
                let b = pop(heap, state)?;
                let a = pop(heap, state)?;
                let text = format!("{}{}", display_value(heap, a), display_value(heap, b));
                let mark = |h: &mut Heap| {
                    mark_roots(h, &state.stack, &state.frames, &state.globals, &state.open_upvalues, state.x_register)
                };
                let interned = heap.intern(&text, mark);
                push(heap, state, Value::Object(interned))?;
            }
            Op::Cons => {
                // Les opérandes restent sur la pile (Peek, pas Pop) tant que
                // `alloc_pair` peut déclencher une collecte — sans quoi ils
                // ne seraient racines nulle part et pourraient être balayés
                // avant que la nouvelle paire ne les référence (§4.1).
                let tail = peek(heap, state, 0)?;
                let head = peek(heap, state, 1)?;
                let mark = |h: &mut Heap| {
                    mark_roots(h, &state.stack, &state.frames, &state.globals, &state.open_upvalues, state.x_register)
                };
                let pair = heap.alloc_pair(head, tail, mark);
                state.stack.truncate(state.stack.len() - 2);
                push(heap, state, Value::Object(pair))?;
            }

            Op::Array(count) => {
                let n = usize::from(count);
                let start = state.stack.len() - n;
                // Clone plutôt que `split_off` : les éléments restent sur la
                // pile (racines GC) jusqu'à ce que `alloc_array` leur ait
                // donné un foyer (§4.1).
                let values: Vec<Value> = state.stack[start..].to_vec();
                let mark = |h: &mut Heap| {
                    mark_roots(h, &state.stack, &state.frames, &state.globals, &state.open_upvalues, state.x_register)
                };
                let arr = heap.alloc_array(values, mark);
                state.stack.truncate(start);
                push(heap, state, Value::Object(arr))?;
            }
            Op::Map(pairs) => {
                let n = usize::from(pairs) * 2;
                let start = state.stack.len() - n;
                // Idem : les clés/valeurs restent sur la pile pendant
                // `alloc_map` (qui peut collecter) ; elles ne sont dépilées
                // qu'une fois insérées dans la table fraîchement allouée.
                let entries: Vec<Value> = state.stack[start..].to_vec();
                let mark = |h: &mut Heap| {
                    mark_roots(h, &state.stack, &state.frames, &state.globals, &state.open_upvalues, state.x_register)
                };
                let map_ref = heap.alloc_map(mark);
                for chunk in entries.chunks(2) {
                    let (key, value) = (chunk[0], chunk[1]);
                    let Value::Object(key_ref) = key else {
                        return Err(runtime_error(heap, state, "map key must be a string"));
                    };
                    let hash = match heap.get(key_ref) {
                        Object::Str(s) => s.hash(),
                        _ => return Err(runtime_error(heap, state, "map key must be a string")),
                    };
                    let Object::Map(table) = heap.get_mut(map_ref) else { unreachable!() };
                    table.set(key_ref, hash, value);
                }
                state.stack.truncate(start);
                push(heap, state, Value::Object(map_ref))?;
            }

            Op::IndexGet => {
                let index = pop(heap, state)?;
                let collection = pop(heap, state)?;
                let value = index_get(heap, state, collection, index)?;
                push(heap, state, value)?;
            }
            Op::IndexSet => {
                let value = pop(heap, state)?;
                let index = pop(heap, state)?;
                let collection = pop(heap, state)?;
                index_set(heap, state, collection, index, value)?;
                push(heap, state, value)?;
            }

            Op::DefGlobal(idx) => {
                let name = const_at(heap, &state.frames[frame_idx], idx);
                let value = pop(heap, state)?;
                let Value::Object(name_ref) = name else { unreachable!("global names are always strings") };
                let hash = string_hash(heap, name_ref);
                state.globals.set(name_ref, hash, value);
            }
            Op::SetGlobal(idx) => {
                let name = const_at(heap, &state.frames[frame_idx], idx);
                let Value::Object(name_ref) = name else { unreachable!("global names are always strings") };
                let hash = string_hash(heap, name_ref);
                let value = *state.stack.last().ok_or_else(|| runtime_error(heap, state, "stack underflow"))?;
                if !state.globals.contains(name_ref, hash) {
                    return Err(runtime_error(
                        heap,
                        state,
                        format!("undefined variable '{}'", string_content(heap, name_ref)),
                    ));
                }
                state.globals.set(name_ref, hash, value);
            }
            Op::GetGlobal(idx) => {
                let name = const_at(heap, &state.frames[frame_idx], idx);
                let Value::Object(name_ref) = name else { unreachable!("global names are always strings") };
                let hash = string_hash(heap, name_ref);
                match state.globals.get(name_ref, hash) {
                    Some(v) => {
                        let v = *v;
                        push(heap, state, v)?;
                    }
                    None => {
                        return Err(runtime_error(
                            heap,
                            state,
                            format!("undefined variable '{}'", string_content(heap, name_ref)),
                        ))
                    }
                }
            }

            Op::GetLocal(slot) => {
                let base = state.frames[frame_idx].base;
                let v = state.stack[base + usize::from(slot)];
                push(heap, state, v)?;
            }
            Op::SetLocal(slot) => {
                let base = state.frames[frame_idx].base;
                let v = *state.stack.last().ok_or_else(|| runtime_error(heap, state, "stack underflow"))?;
                state.stack[base + usize::from(slot)] = v;
            }
            Op::GetUpvalue(slot) => {
                let Object::Closure(c) = heap.get(state.frames[frame_idx].closure) else { unreachable!() };
                let up_ref = c.upvalues[usize::from(slot)];
                let v = match heap.get(up_ref) {
                    Object::Upvalue(UpvalueState::Open(i)) => state.stack[*i],
                    Object::Upvalue(UpvalueState::Closed(v)) => *v,
                    _ => unreachable!(),
                };
                push(heap, state, v)?;
            }
            Op::SetUpvalue(slot) => {
                let v = *state.stack.last().ok_or_else(|| runtime_error(heap, state, "stack underflow"))?;
                let Object::Closure(c) = heap.get(state.frames[frame_idx].closure) else { unreachable!() };
                let up_ref = c.upvalues[usize::from(slot)];
                match heap.get(up_ref) {
                    Object::Upvalue(UpvalueState::Open(i)) => {
                        let i = *i;
                        state.stack[i] = v;
                    }
                    Object::Upvalue(UpvalueState::Closed(_)) => {
                        if let Object::Upvalue(s) = heap.get_mut(up_ref) {
                            *s = UpvalueState::Closed(v);
                        }
                    }
                    _ => unreachable!(),
                }
            }

            Op::Call(argc) => {
                call_value(heap, state, out, argc)?;
            }

            Op::Jump(offset) => {
                state.frames[frame_idx].ip += u32::from(offset);
            }
            Op::JumpBack(offset) => {
                state.frames[frame_idx].ip -= u32::from(offset);
            }
            Op::JumpFalse(offset) => {
                let v = *state.stack.last().ok_or_else(|| runtime_error(heap, state, "stack underflow"))?;
                if !v.is_truthy() {
                    state.frames[frame_idx].ip += u32::from(offset);
                }
            }
            Op::JumpPopFalse(offset) => {
                let v = pop(heap, state)?;
                if !v.is_truthy() {
                    state.frames[frame_idx].ip += u32::from(offset);
                }
            }

            Op::Closure(const_idx, upvalue_descs) => {
                let proto_val = const_at(heap, &state.frames[frame_idx], const_idx);
                let Value::Object(function) = proto_val else { unreachable!("closure constants are functions") };
                let base = state.frames[frame_idx].base;
                let mut upvalues = Vec::with_capacity(upvalue_descs.len());
                for desc in &upvalue_descs {
                    let up = if desc.is_local {
                        capture_upvalue(
                            heap,
                            &state.stack,
                            &state.frames,
                            &state.globals,
                            state.x_register,
                            &mut state.open_upvalues,
                            base + usize::from(desc.index),
                        )
                    } else {
                        let Object::Closure(c) = heap.get(state.frames[frame_idx].closure) else { unreachable!() };
                        c.upvalues[usize::from(desc.index)]
                    };
                    upvalues.push(up);
                }
                let mark = |h: &mut Heap| {
                    mark_roots(h, &state.stack, &state.frames, &state.globals, &state.open_upvalues, state.x_register)
                };
                let closure = heap.alloc_closure(ClosureObj { function, upvalues }, mark);
                push(heap, state, Value::Object(closure))?;
            }
            Op::CloseUpvalue => {
                let top = state.stack.len() - 1;
                close_upvalues_from(heap, &mut state.open_upvalues, &state.stack, top);
                state.stack.pop();
            }

            Op::Return => {
                let value = pop(heap, state)?;
                let base = state.frames[frame_idx].base;
                close_upvalues_from(heap, &mut state.open_upvalues, &state.stack, base);
                state.frames.pop();
                state.stack.truncate(base);
                state.stack.push(value);
            }
            Op::Exit => {
                return Ok(state.stack.last().copied().unwrap_or(Value::Nil));
            }
        }
    }
}
