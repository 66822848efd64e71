//! raven-cli — pilote REPL + exécution de fichiers `.rvn`, mince couche
//! au-dessus de `raven-compiler`/`raven-vm` (§6 — "REPL driver, the CLI
//! entry point ... are treated as collaborators").

use std::io::{self, Write};
use std::path::Path;

use clap::Parser;
use color_eyre::eyre::Result;
use raven_vm::{Vm, VmOptions};

/// Arguments en ligne de commande (`--trace`, `--dump`, chemins de fichiers).
#[derive(Parser, Debug)]
#[command(name = "raven", version, about = "Raven — single-pass bytecode interpreter", long_about = None)]
pub struct Cli {
    /// Fichiers `.rvn` à exécuter, dans l'ordre. Aucun fichier => REPL.
    pub paths: Vec<String>,

    /// Journalise compilation/exécution via `tracing` (équiv. `RAVEN_LOG=debug`).
    #[arg(long)]
    pub trace: bool,

    /// Désassemble chaque prototype top-level sur `stderr` avant de l'exécuter.
    #[arg(long)]
    pub dump: bool,
}

impl Cli {
    fn vm_options(&self) -> VmOptions {
        VmOptions::default().with_trace(self.trace).with_dump(self.dump)
    }
}

/// Point d'entrée partagé par `main` : exécute la CLI déjà parsée, renvoie
/// le code de sortie du processus (§6 — "0 ok; 1 compile error; 1 runtime
/// error").
pub fn run(cli: &Cli) -> Result<i32> {
    if cli.paths.is_empty() {
        repl(cli)?;
        return Ok(0);
    }

    let mut vm = Vm::with_options(cli.vm_options());
    for path in &cli.paths {
        if let Err(err) = run_file(&mut vm, path) {
            eprintln!("{err}");
            return Ok(1);
        }
    }
    Ok(0)
}

fn run_file(vm: &mut Vm, path: &str) -> Result<(), raven_vm::VmError> {
    vm.interpret_file(Path::new(path))?;
    Ok(())
}

/// Boucle REPL : une ligne = un programme, la valeur de la dernière
/// expression de haut niveau (registre X, §4.6) est échoée si non-`nil`.
pub fn repl(cli: &Cli) -> Result<()> {
    let mut vm = Vm::with_options(cli.vm_options());
    println!("Raven {} — ctrl+d to quit", raven_core::VERSION);

    let mut line = String::new();
    let mut line_no = 0usize;
    loop {
        print!("> ");
        io::stdout().flush()?;
        line.clear();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        line_no += 1;
        match vm.interpret_str(&line, format!("<repl:{line_no}>")) {
            Ok(raven_core::Value::Nil) => {}
            Ok(value) => println!("{}", raven_core::display_value(vm.heap(), value)),
            Err(err) => eprintln!("{err}"),
        }
    }
    Ok(())
}
