use std::{fs, path::PathBuf, process::exit, rc::Rc};

use argh::FromArgs;
#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;
use ron::ser::PrettyConfig;
use serde::Serialize;
#[cfg(feature = "tracing-subscriber")]
use tracing_subscriber::EnvFilter;
use zr_vm::{
    backend::{self, zro, WriteOptions, ZroModule},
    error::Error,
    frontend,
    runtime::{self, FileSystemLoader, Function, Vm, VmConfig},
};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// CLI options
#[derive(FromArgs)]
struct Opts {
    #[argh(subcommand)]
    cmd: Cmd,
}

/// Command
#[derive(FromArgs)]
#[argh(subcommand)]
enum Cmd {
    Run(RunCmd),
    Compile(CompileCmd),
}

/// Run a program
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCmd {
    #[argh(positional)]
    source: PathBuf,
    #[argh(switch, description = "run the %test blocks after the entry function")]
    test: bool,
}

/// Compile a program
#[derive(FromArgs)]
#[argh(subcommand, name = "compile")]
struct CompileCmd {
    #[argh(positional)]
    source: PathBuf,
    #[argh(switch, description = "show AST output")]
    ast: bool,
    #[argh(switch, description = "show bytecode output")]
    bytecode: bool,
    #[argh(option, short = 'o', description = "write a .zro binary to this path")]
    output: Option<PathBuf>,
    #[argh(switch, description = "leave line information out of the binary")]
    strip: bool,
}

fn print_ron<T: Serialize>(value: &T) -> Result<(), Error> {
    println!(
        "{}",
        ron::ser::to_string_pretty(
            value,
            PrettyConfig::default()
                .struct_names(true)
                .indentor("  ")
                .compact_arrays(true)
        )?
    );

    Ok(())
}

fn print_func(f: &Function, indent: usize) {
    let prefix = " ".repeat(indent * 2);
    let name = if f.name.is_empty() { "<anonymous>" } else { f.name.as_str() };

    println!(
        "{prefix}fn {name} (params: {}, stack: {}):",
        f.parameter_count, f.stack_size
    );

    if !f.constants.is_empty() {
        println!("{prefix}  constants:");

        for (n, constant) in f.constants.iter().enumerate() {
            println!("{prefix}    {n}: {constant}");
        }
    }

    for (i, instr) in f.instructions.iter().enumerate() {
        let mut label = format!("{prefix}  {i}:");

        while label.len() < 8 + (indent * 2) {
            label.push(' ');
        }

        match f.line_at(i) {
            Some(line) => println!("{label}{instr}  ; line {line}"),
            None => println!("{label}{instr}"),
        }
    }

    for child in f.child_functions.iter() {
        println!();
        print_func(child, indent + 1);
    }
}

fn module_name(source: &std::path::Path) -> String {
    source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".into())
}

fn new_vm(source: &std::path::Path) -> Result<Vm, Error> {
    let mut vm = Vm::new(VmConfig::default())?;
    let root = source
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    vm.set_loader(FileSystemLoader::new(root));

    Ok(vm)
}

#[cfg(feature = "profiler")]
macro_rules! format_col {
    ($max_len:expr, $($arg:tt)*) => {{
        let col = std::fmt::format(format_args!($($arg)*));
        let pad = ($max_len as usize).saturating_sub(col.len());
        format!("{}{}", col, " ".repeat(pad))
    }};
}

#[cfg(feature = "profiler")]
fn print_report(vm: &Vm) {
    let stats = vm.global.gc.stats();
    let report = vm.state.profiler.report();

    println!(
        "\n-- REPORT (took {:?}, {} allocations) --",
        report.exec_time, stats.alloc_count
    );

    for record in report.records {
        println!(
            "{} {}",
            format_col!(20, "{:?}", record.op),
            format_col!(15, "{} calls", record.call_count),
        );
    }
}

fn run(cmd: RunCmd) -> Result<(), Error> {
    let name = module_name(&cmd.source);
    let mut vm = new_vm(&cmd.source)?;

    if cmd.source.extension().is_some_and(|ext| ext == "zro") {
        let module = zro::read_module(&fs::read(&cmd.source)?)?;
        vm.run_function(module.entry)?;
    } else {
        let source = fs::read_to_string(&cmd.source)?;

        if cmd.test {
            let outcomes = vm.run_tests(&source, &name)?;
            let failed = outcomes.iter().filter(|outcome| !outcome.passed()).count();

            for outcome in outcomes.iter() {
                match &outcome.error {
                    Some(error) => println!("test {} ... FAILED: {error}", outcome.name),
                    None => println!("test {} ... ok", outcome.name),
                }
            }

            println!(
                "\n{} passed, {failed} failed",
                outcomes.len() - failed
            );

            if failed > 0 {
                exit(1);
            }
        } else {
            vm.run(&source, &name)?;
        }
    }

    vm.global.collect(&vm.state);

    #[cfg(feature = "profiler")]
    print_report(&vm);

    Ok(())
}

fn compile(cmd: CompileCmd) -> Result<(), Error> {
    let name = module_name(&cmd.source);
    let source = fs::read_to_string(&cmd.source)?;

    if cmd.ast {
        return print_ron(&frontend::parse(&source)?);
    }

    let result = backend::compile(&source, &name, false)?;

    if cmd.bytecode {
        print_func(&result.main_function, 0);
    }

    if let Some(output) = cmd.output {
        let mut module = ZroModule::new(
            result.module_name.unwrap_or(name),
            Rc::clone(&result.main_function),
        );

        module.md5 = format!("{:016x}", runtime::path_hash(&source));

        let data = zro::write_module(
            &module,
            WriteOptions {
                debug: !cmd.strip,
                ..WriteOptions::default()
            },
        );

        fs::write(output, data)?;
    }

    Ok(())
}

fn main() {
    #[cfg(feature = "tracing-subscriber")]
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts: Opts = argh::from_env();
    let result = match opts.cmd {
        Cmd::Run(cmd) => run(cmd),
        Cmd::Compile(cmd) => compile(cmd),
    };

    if let Err(e) = result {
        eprintln!("{e} at {}", e.span());

        if let Error::Runtime(runtime::RuntimeError {
            trace: Some(trace), ..
        }) = e
        {
            for call in trace {
                eprintln!("  {call}");
            }
        }

        exit(1);
    }
}
