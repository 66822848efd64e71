//! Scénarios de bout en bout (§8) : compile + exécute une source Raven
//! complète via [`Vm`], vérifie la valeur exportée (registre X) et/ou la
//! sortie `print`/`println`.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use pretty_assertions::assert_eq;
use raven_core::Value;
use raven_vm::Vm;

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

fn run(src: &str) -> (Result<Value, raven_vm::VmError>, String) {
    let buf = SharedBuf::default();
    let mut vm = Vm::new().with_output(Box::new(buf.clone()));
    let result = vm.interpret_str(src, "<test>");
    (result, buf.text())
}

#[test]
fn arithmetic_and_println() {
    let (result, out) = run("let x = 2 + 3 * 4; println(x);");
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(out, "14\n");
}

#[test]
fn function_call() {
    let (result, out) = run("fn add(a, b) return a + b; end println(add(40, 2));");
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(out, "42\n");
}

#[test]
fn closure_over_mutable_local() {
    let src = "let make = fn(n) return fn() n = n + 1; return n; end; end; \
               let c = make(10); println(c()); println(c()); println(c());";
    let (result, out) = run(src);
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(out, "11\n12\n13\n");
}

#[test]
fn array_push_len_index() {
    let src = "let a = [1, 2, 3]; push(a, 4); println(len(a)); println(a[3]);";
    let (result, out) = run(src);
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(out, "4\n4\n");
}

#[test]
fn while_loop() {
    let src = "let i = 0; while i < 3 do println(i); i = i + 1; end";
    let (result, out) = run(src);
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(out, "0\n1\n2\n");
}

#[test]
fn if_else() {
    let (result, out) = run("if 1 == 1 do println('yes'); else println('no'); end");
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(out, "yes\n");
}

#[test]
fn top_level_expression_is_exported_via_x_register() {
    let (result, _) = run("1 + 1;");
    assert!(matches!(result.unwrap(), Value::Number(n) if n == 2.0));
}

#[test]
fn map_insert_remove() {
    let src = "let m = {}; insert(m, 'a', 1); println(m['a']); remove(m, 'a'); println(len(m));";
    let (result, out) = run(src);
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(out, "1\n0\n");
}

#[test]
fn assert_failure_is_a_runtime_error() {
    let (result, _) = run("assert(1 == 2, 'nope');");
    let err = result.unwrap_err();
    assert!(err.to_string().contains("nope"));
}

#[test]
fn assert_message_must_be_a_string() {
    let (result, _) = run("assert(false, 42);");
    let err = result.unwrap_err();
    assert!(err.to_string().contains("must be a string"));
}

#[test]
fn calling_a_non_function_is_a_runtime_error() {
    let (result, _) = run("let x = 1; x();");
    let err = result.unwrap_err();
    assert!(err.to_string().contains("call"));
}

#[test]
fn array_index_out_of_bounds_is_a_runtime_error() {
    let (result, _) = run("let a = [1, 2]; println(a[5]);");
    let err = result.unwrap_err();
    assert!(err.to_string().contains("out of bounds"));
}

#[test]
fn wrong_arity_is_a_compile_time_irrelevant_runtime_error() {
    let (result, _) = run("fn f(a, b) return a + b; end f(1);");
    let err = result.unwrap_err();
    assert!(err.to_string().contains("expected"));
}

#[test]
fn recursion_within_frame_limit_succeeds() {
    let src = "fn count(n) if n == 0 do return 0; end return 1 + count(n - 1); end \
               println(count(100));";
    let (result, out) = run(src);
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(out, "100\n");
}

#[test]
fn recursion_past_frame_limit_overflows_the_call_stack() {
    let src = "fn count(n) if n == 0 do return 0; end return 1 + count(n - 1); end \
               println(count(1000));";
    let (result, _) = run(src);
    let err = result.unwrap_err();
    assert!(err.to_string().contains("call stack overflows"));
}

#[test]
fn cond_chain_selects_first_true_branch() {
    let src = "cond 1 == 2 -> println('a'), 1 == 1 -> println('b'), end";
    let (result, out) = run(src);
    assert!(result.is_ok(), "{:?}", result.err());
    assert_eq!(out, "b\n");
}
