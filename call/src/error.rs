use std::process::ExitCode;

use tether::CallError;

pub type CliResult<T> = anyhow::Result<T>;

/// Exit status when the host answered with a failure
const CALL_REJECTED: u8 = 2;

/// Map a result to an exit code, printing the error chain to stderr
///
/// A call the host rejected exits with 2; local failures (config, socket,
/// arguments) exit with 1.
pub fn to_exit_code(result: CliResult<()>) -> ExitCode {
    let Err(e) = result else {
        return ExitCode::SUCCESS;
    };

    if let Some(call) = e.downcast_ref::<CallError>() {
        eprintln!("error: {} ({})", call, call.kind());
        return ExitCode::from(CALL_REJECTED);
    }

    eprintln!("error: {e}");
    for cause in e.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
    ExitCode::FAILURE
}
