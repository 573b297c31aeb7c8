use std::path::PathBuf;
use std::process::exit;

use fnroute::consts::TRACER_FAILURE_CODE;
use fnroute::errors::Result;
use fnroute::launcher::{self, Strategy};
use fnroute::outcome::Outcome;
use fnroute::routing::RoutingTable;
use fnroute::tracer::Tracer;

use clap::Parser;
use tracing::{error, info, trace};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template = r#"{about-section}
{usage-heading} {usage}
{all-args}{tab}

{name}: v{version}
"#
)]
/// Redirect calls to named functions of a program
///
/// Reads a mapping of `"source": "target"` function names (globs allowed in sources) and runs
/// the program so that calls to a source function end up in its target. Functions mapped to
/// themselves, or to functions the program does not have, are only logged.
struct Args {
    #[arg(short, long)]
    /// Mapping file, defaults to $WRAP_MAP or ./function_map.json
    map: Option<PathBuf>,

    #[arg(long, value_enum)]
    /// Interception strategy, defaults to $WRAP_MODE or ptrace
    mode: Option<Strategy>,

    #[arg(long)]
    /// Interposer library for the preload strategy, defaults to $WRAP_PRELOAD or ./libwrap.so
    preload_lib: Option<PathBuf>,

    #[arg(long)]
    /// Run the program with address space randomization disabled
    no_aslr: bool,

    #[arg(long)]
    /// Print the planned interception sites as JSON and exit without running the program
    plan: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    /// Log more, repeat for even more
    verbose: u8,

    #[arg(short, long, conflicts_with = "verbose")]
    /// Only log warnings and errors
    quiet: bool,

    /// The program to run
    program: PathBuf,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    /// Arguments for the program
    args: Vec<String>,
}

fn main() {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(&args);

    match run(&args) {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{e}");
            exit(TRACER_FAILURE_CODE);
        }
    }
}

fn run(args: &Args) -> Result<i32> {
    let strategy = args.mode.unwrap_or_else(Strategy::from_env);

    let private_table;
    let table = match &args.map {
        Some(path) => {
            private_table = RoutingTable::from_file(path);
            &private_table
        }
        None => RoutingTable::global(),
    };

    if args.plan {
        let tracer = Tracer::build(&args.program, table);
        println!("{}", serde_json::to_string_pretty(&tracer.plan()?)?);
        return Ok(0);
    }

    let outcome = match strategy {
        Strategy::Ptrace => {
            let report = Tracer::build(&args.program, table)
                .args(args.args.iter().cloned())
                .disable_aslr(args.no_aslr)
                .run()?;
            for hit in &report.hits {
                info!("{}: {} calls intercepted", hit.symbol, hit.hits);
            }
            report.outcome
        }
        Strategy::Preload => {
            let map = args.map.clone().unwrap_or_else(launcher::map_path_from_env);
            let lib = args
                .preload_lib
                .clone()
                .unwrap_or_else(launcher::preload_lib_from_env);
            launcher::run_preloaded(&args.program, &args.args, &lib, &map)?
        }
    };

    if let Outcome::Signaled(sig) = outcome {
        error!("Child terminated by signal {sig}");
    }
    Ok(outcome.exit_code())
}

fn setup_logger(args: &Args) {
    let level = match (args.quiet, args.verbose) {
        (true, _) => tracing::Level::WARN,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };
    // the target owns stdout, logs go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
    trace!("set up the logger");
}
