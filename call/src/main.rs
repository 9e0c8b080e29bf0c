//! Command-line guest for a tether host
//!
//! Usage:
//!   tether-call <channel> [args...]
//!   tether-call double 21
//!   tether-call search '{"query": "rust async", "limit": 5}'

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use tether::protocol::{Frame, Invocation, Outcome, with_length_prefix};
use tether::{CallError, Value};

mod cli;
mod config;
mod error;
mod value;

use cli::Cli;
use config::{MergedConfig, load_config, merge_config};
use error::{CliResult, to_exit_code};

/// The CLI opens one connection per invocation, so the id only has to be unique on it
const CALL_ID: u64 = 1;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tether=debug,tether_call=debug"
    } else {
        "tether=warn,tether_call=warn"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    to_exit_code(run(cli))
}

fn run(cli: Cli) -> CliResult<()> {
    let file_config = load_config(cli.config.as_deref())?;
    let config = merge_config(file_config, &cli)?;

    let arguments = cli
        .args
        .iter()
        .enumerate()
        .map(|(i, arg)| value::parse_arg(arg).with_context(|| format!("argument {i}")))
        .collect::<CliResult<Vec<_>>>()?;

    let result = call(&config, &cli.channel, arguments)?;
    let json = value::to_json(result)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn call(config: &MergedConfig, channel: &str, arguments: Vec<Value>) -> CliResult<Value> {
    let body = Frame::Call(Invocation {
        id: CALL_ID,
        channel: channel.to_string(),
        arguments,
    })
    .encode()?;
    if body.len() > config.max_frame_len {
        bail!(
            "call of {} bytes exceeds the frame limit of {}",
            body.len(),
            config.max_frame_len
        );
    }

    let mut stream = UnixStream::connect(&config.socket)
        .with_context(|| format!("failed to connect to {}", config.socket.display()))?;
    stream.set_read_timeout(config.timeout)?;
    tracing::debug!(socket = %config.socket.display(), channel, "sending call");

    stream
        .write_all(&with_length_prefix(&body)?)
        .context("failed to send call")?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            anyhow::Error::new(CallError::TimedOut(channel.to_string()))
        }
        std::io::ErrorKind::UnexpectedEof => {
            anyhow::Error::new(CallError::Disconnected(channel.to_string()))
        }
        _ => anyhow::Error::new(e).context("failed to read reply length"),
    })?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > config.max_frame_len {
        bail!("invalid reply length: {len}");
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .context("failed to read reply body")?;

    match Frame::decode(&body)? {
        Frame::Reply(reply) if reply.id == CALL_ID => match reply.outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(CallError::from(failure).into()),
        },
        Frame::Reply(reply) => bail!("reply for unexpected call {}", reply.id),
        Frame::Call(_) => bail!("host sent a call frame"),
    }
}
