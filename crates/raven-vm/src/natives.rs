//! natives.rs — fonctions natives installées dans les globales (§6).
//!
//! Chaque native reçoit un [`NativeCtx`] (tas, sortie, callback `import`) et
//! la tranche d'arguments déjà validée en arité par l'appelant
//! ([`crate::exec::call_value`]) — le corps n'a donc qu'à vérifier les
//! *types*.

use std::io::Write;

use raven_core::object::{NativeCtx, NativeFnObj, Object, PARAMS_LIMIT};
use raven_core::table::Table;
use raven_core::{display_value, Heap, Value};

/// Installe toutes les fonctions natives du langage dans `globals` (§6).
pub fn install_natives(heap: &mut Heap, globals: &mut Table<Value>) {
    register(heap, globals, "import", 1, 1, native_import);
    register(heap, globals, "assert", 1, 2, native_assert);
    register(heap, globals, "print", 0, PARAMS_LIMIT, native_print);
    register(heap, globals, "println", 0, PARAMS_LIMIT, native_println);
    register(heap, globals, "len", 1, 1, native_len);
    register(heap, globals, "push", 2, PARAMS_LIMIT, native_push);
    register(heap, globals, "pop", 1, 1, native_pop);
    register(heap, globals, "insert", 3, 3, native_insert);
    register(heap, globals, "remove", 2, 2, native_remove);
}

fn register(
    heap: &mut Heap,
    globals: &mut Table<Value>,
    name: &'static str,
    arity_min: u8,
    arity_max: u8,
    func: raven_core::object::NativeFn,
) {
    let name_ref = heap.intern(name, |_| {});
    let hash = match heap.get(name_ref) {
        Object::Str(s) => s.hash(),
        _ => unreachable!(),
    };
    let native_ref = heap.alloc_native(NativeFnObj { name, arity_min, arity_max, func }, |_| {});
    globals.set(name_ref, hash, Value::Object(native_ref));
}

fn native_import(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let Value::Object(r) = args[0] else {
        return Err("import: expected a string path".to_string());
    };
    let path = match ctx.heap.get(r) {
        Object::Str(s) => s.as_str().to_string(),
        _ => return Err("import: expected a string path".to_string()),
    };
    (ctx.import)(ctx.heap, ctx.out, &path)
}

fn native_assert(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let message = match args.get(1) {
        Some(Value::Object(r)) => match ctx.heap.get(*r) {
            Object::Str(s) => s.as_str().to_string(),
            _ => return Err("assert: message must be a string".to_string()),
        },
        Some(_) => return Err("assert: message must be a string".to_string()),
        None => "assertion failed".to_string(),
    };
    if args[0].is_truthy() {
        return Ok(Value::Nil);
    }
    Err(message)
}

fn native_print(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    for v in args {
        write!(ctx.out, "{}", display_value(ctx.heap, *v)).map_err(|e| e.to_string())?;
    }
    Ok(Value::Nil)
}

fn native_println(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let parts: Vec<String> = args.iter().map(|v| display_value(ctx.heap, *v)).collect();
    writeln!(ctx.out, "{}", parts.join(" ")).map_err(|e| e.to_string())?;
    Ok(Value::Nil)
}

fn native_len(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    match args[0] {
        Value::Object(r) => match ctx.heap.get(r) {
            Object::Str(s) => Ok(Value::Number(s.as_str().chars().count() as f64)),
            Object::Array(a) => Ok(Value::Number(a.len() as f64)),
            Object::Map(m) => Ok(Value::Number(m.len() as f64)),
            _ => Err("len: expected a string, array or map".to_string()),
        },
        _ => Err("len: expected a string, array or map".to_string()),
    }
}

fn native_push(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let Value::Object(r) = args[0] else {
        return Err("push: expected an array".to_string());
    };
    match ctx.heap.get_mut(r) {
        Object::Array(a) => {
            a.extend_from_slice(&args[1..]);
            Ok(args[0])
        }
        _ => Err("push: expected an array".to_string()),
    }
}

fn native_pop(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let Value::Object(r) = args[0] else {
        return Err("pop: expected an array".to_string());
    };
    match ctx.heap.get_mut(r) {
        Object::Array(a) => a.pop().ok_or_else(|| "pop: array is empty".to_string()),
        _ => Err("pop: expected an array".to_string()),
    }
}

fn native_insert(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let Value::Object(map_ref) = args[0] else {
        return Err("insert: expected a map".to_string());
    };
    let Value::Object(key_ref) = args[1] else {
        return Err("insert: map key must be a string".to_string());
    };
    let hash = match ctx.heap.get(key_ref) {
        Object::Str(s) => s.hash(),
        _ => return Err("insert: map key must be a string".to_string()),
    };
    match ctx.heap.get_mut(map_ref) {
        Object::Map(m) => {
            m.set(key_ref, hash, args[2]);
            Ok(args[2])
        }
        _ => Err("insert: expected a map".to_string()),
    }
}

fn native_remove(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let Value::Object(map_ref) = args[0] else {
        return Err("remove: expected a map".to_string());
    };
    let Value::Object(key_ref) = args[1] else {
        return Err("remove: map key must be a string".to_string());
    };
    let hash = match ctx.heap.get(key_ref) {
        Object::Str(s) => s.hash(),
        _ => return Err("remove: map key must be a string".to_string()),
    };
    match ctx.heap.get_mut(map_ref) {
        Object::Map(m) => Ok(m.delete(key_ref, hash).unwrap_or(Value::Nil)),
        _ => Err("remove: expected a map".to_string()),
    }
}
