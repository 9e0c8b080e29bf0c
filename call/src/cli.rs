use std::path::PathBuf;

use clap::Parser;

/// Call a channel on the tether host this sandbox is connected to
///
/// Arguments are parsed as JSON where possible (`42`, `true`, `{"a": 1}`) and
/// passed as strings otherwise. `@path` passes the contents of a file as a
/// byte buffer.
#[derive(Parser)]
#[command(name = "tether-call")]
#[command(version)]
#[command(about = "Call a tether channel from inside a sandbox")]
pub struct Cli {
    /// Channel name to invoke
    pub channel: String,

    /// Arguments forwarded to the channel, in order
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Host socket path (defaults to $TETHER_SOCKET)
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Seconds to wait for the reply
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Path to config file (TOML)
    #[arg(short, long, env = "TETHER_CALL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_args_keep_hyphens() {
        let cli = Cli::parse_from(["tether-call", "-t", "5", "search", "--query", "-x"]);
        assert_eq!(cli.channel, "search");
        assert_eq!(cli.args, ["--query", "-x"]);
        assert_eq!(cli.timeout, Some(5));
    }
}
