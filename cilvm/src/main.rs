use clap::Parser as ClapParser;
use log::LevelFilter;
use std::process;

use cilvm::{Runtime, RuntimeCreateInfo, TypeRegistry, samples};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sample program to run
    #[arg(required_unless_present = "list", help = "Name of the sample to run")]
    sample: Option<String>,

    /// Arguments handed to the entry point as string[]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// List the available samples and exit
    #[arg(long)]
    list: bool,

    /// Bytes reserved for evaluation stacks, locals and call data
    #[arg(long, value_name = "BYTES")]
    stack_size: Option<usize>,

    /// Maximum bytes the heap may hand out
    #[arg(long, value_name = "BYTES")]
    heap_limit: Option<usize>,

    /// Print instruction and call counts after the run
    #[arg(long)]
    stats: bool,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if cli.list {
        for sample in samples::SAMPLES {
            println!("{:<12} {}", sample.name, sample.description);
        }
        return;
    }

    let Some(name) = cli.sample.as_deref() else {
        eprintln!("no sample given, try --list");
        process::exit(1);
    };
    let Some(sample) = samples::find(name) else {
        eprintln!("unknown sample '{name}', try --list");
        process::exit(1);
    };

    let mut types = TypeRegistry::new();
    let entry = (sample.build)(&mut types);
    let info = RuntimeCreateInfo {
        stack_size: cli.stack_size,
        heap_limit: cli.heap_limit,
        ..Default::default()
    };
    let mut runtime = match Runtime::new(types, info) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error starting runtime: {err}");
            process::exit(1);
        }
    };

    let result = runtime.run_entry_point(entry, &cli.args);
    if cli.stats {
        eprintln!(
            "{} instructions, {} calls, {} objects, {} bytes of stack at peak",
            runtime.stats.instructions,
            runtime.stats.calls,
            runtime.heap.object_count(),
            runtime.stack.high_water()
        );
    }
    match result {
        Ok(code) => process::exit(code),
        Err(cilvm::VmError::Unhandled {
            type_name,
            message,
            trace,
        }) => {
            eprintln!(
                "Unhandled exception: {type_name}: {}",
                message.as_deref().unwrap_or("<no message>")
            );
            for line in trace {
                eprintln!("   {line}");
            }
            process::exit(1);
        }
        Err(err) => {
            eprintln!("Error executing {name}: {err}");
            process::exit(1);
        }
    }
}
