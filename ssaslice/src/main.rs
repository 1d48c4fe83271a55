use ssaslice::*;

use std::path::PathBuf;

use clap::Parser;

use ssaslice::error::{Error, Result};
use ssaslice::evaluator::{default_symbolic_stack_reads, Environment};
use ssaslice::expr::{Assignment, VersionedRegister};
use ssaslice::il::{Function, Program};
use ssaslice::memory::MemoryImage;

/// Slice, render, and evaluate SSA IL listings
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Compute the backward dependency slice of an instruction or register
    Slice {
        /// Path to an SSA IL listing
        listing: PathBuf,
        /// Address of the instruction to slice from
        #[clap(long, parse(try_from_str = parse_u64))]
        address: Option<u64>,
        /// Function containing the register to slice from
        #[clap(long)]
        function: Option<String>,
        /// Register to slice from (its latest SSA version in the function)
        #[clap(long)]
        register: Option<String>,
        /// Print the expression model, rather than masked infix text
        #[clap(long)]
        structured: bool,
        /// Output the dependency graph of the slice as a GraphViz `.dot` file to the given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// Compute one slice for each memory write in a function
    MemoryWrites {
        /// Path to an SSA IL listing
        listing: PathBuf,
        /// Function to scan (defaults to the first function of the listing)
        #[clap(long)]
        function: Option<String>,
        /// Print the expression model, rather than masked infix text
        #[clap(long)]
        structured: bool,
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// Compute the final values of registers
    Evaluate {
        /// Path to an SSA IL listing
        listing: PathBuf,
        /// Function to evaluate (defaults to the first function of the listing)
        #[clap(long)]
        function: Option<String>,
        /// Register to compute the final value of (repeatable)
        #[clap(long = "target", required = true)]
        targets: Vec<String>,
        /// Initial value of a register version, as `reg#version=value` (repeatable)
        #[clap(long = "init", parse(try_from_str = parse_init))]
        inits: Vec<(VersionedRegister, u64)>,
        /// Runtime key, read from the stack by the dispatcher
        #[clap(long, parse(try_from_str = parse_u64))]
        key: Option<u64>,
        #[clap(flatten)]
        memory: MemoryArgs,
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// Compute the state a VM dispatcher hands over to its first handler
    VmEnter {
        /// Path to an SSA IL listing
        listing: PathBuf,
        /// The dispatcher (defaults to the first function of the listing)
        #[clap(long)]
        function: Option<String>,
        /// Runtime key, read from the stack by the dispatcher
        #[clap(long, parse(try_from_str = parse_u64))]
        key: u64,
        #[clap(flatten)]
        memory: MemoryArgs,
        #[clap(flatten)]
        common: CommonArgs,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct MemoryArgs {
    /// Path to a flat memory image, serving memory reads
    #[clap(long)]
    image: Option<PathBuf>,
    /// Address at which the memory image is mapped
    #[clap(long, default_value = "0", parse(try_from_str = parse_u64))]
    image_base: u64,
}

#[derive(clap::Args, Debug, Clone)]
struct CommonArgs {
    /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
    /// use.
    #[clap(long)]
    debug_disable_terminal_logging: bool,
    /// Force blocking for terminal logging. If too many messages are being spewed the logger,
    /// by default, does not block, but instead dumps a dropped-messages alert. This option
    /// forces it to block and dump even if too many are being sent.
    #[clap(long)]
    debug_forced_blocking_terminal_logging: bool,
    /// Path to send log (as JSON) to
    ///
    /// Error or higher severity alerts will still continue being shown at stderr (in addition
    /// to being added to the log)
    #[clap(long = "log")]
    log_file: Option<PathBuf>,
    /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
    #[clap(short, long, parse(from_occurrences))]
    debug: usize,
    /// Advanced configuration options to tweak slicing and evaluation behavior
    #[clap(short = 'Z', long, arg_enum)]
    advanced_config: Vec<analysis_config::CommandLineAnalysisConfig>,
}

impl Args {
    fn common(&self) -> &CommonArgs {
        match self {
            Args::Slice { common, .. }
            | Args::MemoryWrites { common, .. }
            | Args::Evaluate { common, .. }
            | Args::VmEnter { common, .. } => common,
        }
    }
}

fn parse_u64(s: &str) -> std::result::Result<u64, String> {
    match s.strip_prefix("0x") {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("`{}`: {}", s, e))
}

/// `reg#version=value`
fn parse_init(s: &str) -> std::result::Result<(VersionedRegister, u64), String> {
    let (reg, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected `reg#version=value`, got `{}`", s))?;
    let (name, version) = reg
        .trim()
        .split_once('#')
        .ok_or_else(|| format!("expected `reg#version`, got `{}`", reg))?;
    let version = version
        .parse()
        .map_err(|e| format!("`{}`: {}", version, e))?;
    Ok((VersionedRegister::new(name, version), parse_u64(value.trim())?))
}

fn select_function<'p>(program: &'p Program, name: Option<&str>) -> Result<&'p Function> {
    match name {
        Some(name) => program.function_named(name),
        None => program
            .functions
            .first()
            .ok_or_else(|| Error::UnknownFunction("<first>".into())),
    }
}

fn load_memory(memory: &MemoryArgs) -> Result<MemoryImage> {
    match &memory.image {
        Some(path) => MemoryImage::from_flat_file(path, memory.image_base),
        None => Ok(MemoryImage::new()),
    }
}

fn print_slice(slice: &[Assignment], program: &Program, structured: bool) -> Result<()> {
    let in_order = slicer::execution_order(slice);
    if structured {
        for a in &in_order {
            println!("{}", a);
        }
    } else {
        for l in render::render_assignments(&in_order, program.arch)? {
            println!("{}", l);
        }
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    match args {
        Args::Slice {
            listing,
            address,
            function,
            register,
            structured,
            debug_output_graphviz,
            common: _,
        } => {
            let program = lifter::lift_from_file(listing)?;
            let slice = match (address, function, register) {
                (Some(address), None, None) => slicer::slice_from_address(&program, address)?,
                (None, function, Some(register)) => slicer::slice_from_register_name(
                    select_function(&program, function.as_deref())?,
                    &register,
                )?,
                _ => {
                    return Err(Error::ConfigurationError {
                        message: "expected either `--address`, or `--register` (and optionally \
                                  `--function`)"
                            .into(),
                    })
                }
            };
            print_slice(&slice, &program, structured)?;
            if let Some(path) = debug_output_graphviz {
                graph::write_slice_dot(&slice, program.arch, &mut std::fs::File::create(path)?)?;
            }
        }
        Args::MemoryWrites {
            listing,
            function,
            structured,
            common: _,
        } => {
            let program = lifter::lift_from_file(listing)?;
            let function = select_function(&program, function.as_deref())?;
            for (i, slice) in slicer::slice_all_memory_writes(function)?
                .iter()
                .enumerate()
            {
                println!("; memory write #{}", i);
                print_slice(slice, &program, structured)?;
            }
        }
        Args::Evaluate {
            listing,
            function,
            targets,
            inits,
            key,
            memory,
            common: _,
        } => {
            let program = lifter::lift_from_file(listing)?;
            let function = select_function(&program, function.as_deref())?;
            let mut env = Environment::new();
            for (reg, value) in inits {
                env.bind_register(reg, value);
            }
            if let Some(key) = key {
                env.bind_named("key", key);
            }
            let image = load_memory(&memory)?;
            let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
            let state = evaluator::evaluate_final_register_state(
                function,
                &targets,
                &env,
                &image,
                &default_symbolic_stack_reads(),
            )?;
            for (reg, value) in state {
                println!("{} = {:#x}", reg, value);
            }
        }
        Args::VmEnter {
            listing,
            function,
            key,
            memory,
            common: _,
        } => {
            let program = lifter::lift_from_file(listing)?;
            let function = select_function(&program, function.as_deref())?;
            let image = load_memory(&memory)?;
            let state = vm_entry::evaluate_vm_entry(function, key, &image)?;
            print!("{}", state);
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let common = args.common().clone();
    let log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
        common.debug,
        common.debug_disable_terminal_logging,
        common.debug_forced_blocking_terminal_logging,
        common.log_file,
    ));

    analysis_config::AnalysisConfig::initialize(common.advanced_config);

    let res = run(args);
    if let Err(e) = &res {
        log::error!("Aborted"; "error" => %e);
    }
    log::trace!("Done");
    drop(log_guard);
    if let Err(e) = res {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
