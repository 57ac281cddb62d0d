const HELP: &str = "\
duckline-executor - HID executor node

Listens for a driver connection and turns incoming script lines into HID
actions.

USAGE:
  duckline-executor [OPTIONS]

OPTIONS:
  -h, --help            Prints help information
  --socket <path>       Unix socket path (default: /tmp/duckline.sock)
  --tcp <host:port>     Listen on TCP instead of a Unix socket
  --blockdev <dir>      Mount a directory as the block device (enables the
                        secondary channel)
  --autorun <file>      Run this block-device script at startup
  -v, --verbose         Show connection and protocol events
  -vv, --trace          Show all protocol traffic
  -vvv, --trace-wire    Show individual wire bytes (very verbose)
  --log <file>          Write trace output to file instead of stderr
";

/// Verbosity level for debug output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// No debug output
    Quiet = 0,
    /// Connection events, errors
    Verbose = 1,
    /// All protocol traffic
    Trace = 2,
    /// Individual wire bytes
    TraceWire = 3,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Quiet
    }
}

#[derive(Debug)]
pub struct AppArgs {
    pub socket_path: Option<String>,
    pub tcp_addr: Option<String>,
    pub blockdev: Option<String>,
    pub autorun: Option<String>,
    pub verbosity: Verbosity,
    pub log_file: Option<String>,
}

pub fn parse_args() -> Result<AppArgs, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        print!("{}", HELP);
        std::process::exit(0);
    }

    let verbosity = if pargs.contains("--trace-wire") || pargs.contains("-vvv") {
        Verbosity::TraceWire
    } else if pargs.contains("--trace") || pargs.contains("-vv") {
        Verbosity::Trace
    } else if pargs.contains(["-v", "--verbose"]) {
        Verbosity::Verbose
    } else {
        Verbosity::Quiet
    };

    let args = AppArgs {
        socket_path: pargs.opt_value_from_str("--socket")?,
        tcp_addr: pargs.opt_value_from_str("--tcp")?,
        blockdev: pargs.opt_value_from_str("--blockdev")?,
        autorun: pargs.opt_value_from_str("--autorun")?,
        verbosity,
        log_file: pargs.opt_value_from_str("--log")?,
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Warning: unused arguments left: {:?}.", remaining);
    }

    Ok(args)
}
