//! vm.rs — façade publique : compile puis exécute, restitue une valeur ou
//! une [`VmError`] tracée (§7).

use std::io::{self, Write};
use std::path::Path;

use raven_core::{display_value, Heap, Value};

use crate::error::VmError;
use crate::exec::{self, CallFrame, ExecState};

#[cfg(feature = "tracing")]
use tracing::{debug, info};

/// Options de construction de la [`Vm`] (miroir de `VmOptions` côté `vitte-vm` :
/// builder `with_*`, valeurs par défaut raisonnables).
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Si vrai, désassemble chaque prototype top-level vers `stderr` avant
    /// de l'exécuter (`--dump` côté CLI).
    pub dump: bool,
    /// Si vrai et la feature `tracing` est active, journalise chaque
    /// fichier compilé/exécuté (`--trace` côté CLI).
    pub trace: bool,
}

impl VmOptions {
    /// Active/désactive le désassemblage (`--dump`).
    #[must_use]
    pub const fn with_dump(mut self, on: bool) -> Self {
        self.dump = on;
        self
    }
    /// Active/désactive la trace (`--trace`).
    #[must_use]
    pub const fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }
}

/// Machine virtuelle Raven : tas, état d'exécution, sortie, options.
///
/// Une `Vm` peut exécuter plusieurs sources à la suite (mode REPL côté
/// `raven-cli`) : les globales et le tas persistent entre deux appels à
/// [`Vm::interpret_str`]/[`Vm::interpret_file`], seule la pile/la pile de
/// frames sont vidées après chaque exécution (succès ou erreur).
pub struct Vm {
    heap: Heap,
    state: ExecState,
    out: Box<dyn Write>,
    options: VmOptions,
}

impl Vm {
    /// VM neuve, sortie standard, options par défaut.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    /// VM neuve avec options explicites.
    #[must_use]
    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        let state = ExecState::new(&mut heap, "<stdin>");
        Self { heap, state, out: Box::new(io::stdout()), options }
    }

    /// Redirige la sortie de `print`/`println` (tests, REPL capturé, etc.).
    #[must_use]
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    /// Tas sous-jacent (lecture, pour les tests : compter les objets vivants).
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Interprète une source en mémoire. `file` n'est utilisé que pour les
    /// diagnostics (§7).
    pub fn interpret_str(&mut self, source: &str, file: impl Into<String>) -> Result<Value, VmError> {
        let file = file.into();
        #[cfg(feature = "tracing")]
        if self.options.trace {
            info!(target: "raven-vm", file = %file, "compiling");
        }

        let proto = raven_compiler::compile_str(source, file.clone(), &mut self.heap)?;
        self.run_toplevel(proto, file)
    }

    /// Lit et interprète un fichier `.rvn`.
    pub fn interpret_file(&mut self, path: impl AsRef<Path>) -> Result<Value, VmError> {
        let path = path.as_ref();
        let file = path.display().to_string();
        #[cfg(feature = "tracing")]
        if self.options.trace {
            info!(target: "raven-vm", file = %file, "compiling");
        }

        let proto = raven_compiler::compile_file(path, &mut self.heap)?;
        self.run_toplevel(proto, file)
    }

    fn run_toplevel(&mut self, proto: raven_core::ObjRef, file: String) -> Result<Value, VmError> {
        if self.options.dump {
            if let raven_core::Object::Function(f) = self.heap.get(proto) {
                eprintln!("{}", f.chunk.disassemble(&file));
            }
        }

        self.state.current_file = file;
        let closure = exec::wrap_toplevel_closure(&mut self.heap, &self.state, proto);
        self.state.stack.push(Value::Object(closure));
        self.state.frames.push(CallFrame { closure, ip: 0, base: self.state.stack.len() - 1 });

        #[cfg(feature = "tracing")]
        if self.options.trace {
            debug!(target: "raven-vm", "running");
        }

        let result = exec::run_until(&mut self.heap, &mut self.state, &mut self.out, 0);

        self.state.stack.clear();
        self.state.frames.clear();
        self.state.open_upvalues.clear();

        Ok(result?)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Représentation textuelle d'une valeur retournée par la VM (`@`/REPL echo,
/// §4.5).
#[must_use]
pub fn format_result(heap: &Heap, value: Value) -> String {
    display_value(heap, value)
}
