use machemu::staging::{FrameworkRoot, WorkDir};
use machemu::sys::darwin::xnu::host_path_resolver;
use machemu::{Cpu, ImageId, Task, TaskBuilder};
use std::path::{Path, PathBuf};
use std::{env, process::exit};
use tracing::error;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: machemu [--trace-code] [--library-root DIR] [--work-dir DIR] \
[--symbol NAME] [--load-only] [--] <program>";

struct Opts {
    /// Whether to log every executed instruction.
    trace_code: bool,

    /// Directory holding the device's system libraries.
    library_root: Option<PathBuf>,

    /// Directory input files are copied into before loading.
    work_dir: Option<PathBuf>,

    /// The symbol to call; the entry point when absent.
    symbol: Option<String>,

    /// Load and bind without running anything.
    load_only: bool,

    /// The program to load.
    program: String,
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    let opts = match parse_opts(&args) {
        Some(opts) => opts,
        None => {
            eprintln!("{}", USAGE);
            exit(1);
        }
    };

    if let Err(e) = run(&opts) {
        error!("{}", e);
        eprintln!("machemu: {}", e);
        exit(1);
    }
}

fn run(opts: &Opts) -> machemu::Result<()> {
    let mut builder = TaskBuilder::new().trace_code(opts.trace_code);
    builder = match &opts.library_root {
        Some(root) => builder.resolver(FrameworkRoot::new(root)),
        None => builder.resolver(host_path_resolver),
    };
    if let Some(dir) = &opts.work_dir {
        let work_dir = WorkDir::new(dir);
        work_dir.reset()?;
        builder = builder.stager(work_dir);
    }

    if opts.load_only {
        let mut task = builder.build(machemu::runtime::StaticMemory::new())?;
        let id = task.load(Path::new(&opts.program))?;
        print_images(&task, id);
        return Ok(());
    }
    execute(builder, opts)
}

#[cfg(feature = "unicorn")]
fn execute(builder: TaskBuilder, opts: &Opts) -> machemu::Result<()> {
    let mut task = builder.build(machemu::runtime::unicorn::UnicornCpu::new()?)?;
    let id = task.load(Path::new(&opts.program))?;
    let ret = match &opts.symbol {
        Some(symbol) => task.call(id, symbol)?,
        None => task.run_entry(id)?,
    };
    println!("returned 0x{:x}", ret);
    Ok(())
}

#[cfg(not(feature = "unicorn"))]
fn execute(_builder: TaskBuilder, _opts: &Opts) -> machemu::Result<()> {
    Err(machemu::Error::Emulator(
        "built without an emulator backend, rebuild with --features unicorn or pass --load-only"
            .to_string(),
    ))
}

fn print_images<C: Cpu>(task: &Task<C>, main: ImageId) {
    let loader = task.loader();
    for image in loader.images() {
        let marker = if image.id == main { "*" } else { " " };
        println!(
            "{} 0x{:012x}-0x{:012x} {} ({} symbols, {} dependencies)",
            marker,
            image.start,
            image.start + image.size,
            image.name,
            image.symbols.len(),
            image.dependencies.len()
        );
    }
}

fn parse_opts(args: &[String]) -> Option<Opts> {
    let mut opts = Opts {
        trace_code: false,
        library_root: None,
        work_dir: None,
        symbol: None,
        load_only: false,
        program: String::new(),
    };
    let mut i = 1; // Skip program name
    while i < args.len() {
        match args[i].as_str() {
            "--trace-code" => opts.trace_code = true,
            "--load-only" => opts.load_only = true,
            "--library-root" => {
                i += 1;
                opts.library_root = Some(PathBuf::from(args.get(i)?));
            }
            "--work-dir" => {
                i += 1;
                opts.work_dir = Some(PathBuf::from(args.get(i)?));
            }
            "--symbol" => {
                i += 1;
                opts.symbol = Some(args.get(i)?.clone());
            }
            "--" => {
                opts.program = args.get(i + 1)?.clone();
                break;
            }
            arg if arg.starts_with("--") => return None,
            arg => {
                opts.program = arg.to_string();
                break;
            }
        }
        i += 1;
    }
    if opts.program.is_empty() {
        return None;
    }
    Some(opts)
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
