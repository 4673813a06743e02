//! `spindle` binary.
//!
//! - `spindle serve` accepts TCP connections and offers the [demo service](spindle_server::demo)
//! - `spindle call` / `spindle notify` talk to a running server

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::Value;
use spindle_reactor::{Listener, PollReactor, connect};
use spindle_rpc::{CallError, Params, Reactor, Session, SessionConfig, WireFormat};
use spindle_server::{ServerConfig, demo};
use tracing::info;

mod cli;

use cli::{Cli, Command, PeerArgs};

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	setup_tracing(cli.verbose);

	match cli.command {
		Command::Serve { listen, format, config } => serve(listen, format, config),
		Command::Call {
			peer,
			method,
			params,
			timeout_ms,
		} => call(&peer, &method, &params, Duration::from_millis(timeout_ms)),
		Command::Notify { peer, method, params } => notify(&peer, &method, &params),
	}
}

fn serve(listen: Option<std::net::SocketAddr>, format: Option<WireFormat>, path: Option<PathBuf>) -> anyhow::Result<()> {
	let mut config = ServerConfig::load(path.as_deref())?;
	if let Some(listen) = listen {
		config.listen = listen;
	}
	if let Some(format) = format {
		config.session.format = format;
	}
	config.session.validate()?;

	let reactor: Rc<dyn Reactor> = Rc::new(PollReactor::new()?);
	let service = demo::service();
	let session = config.session.clone();
	let sessions = Rc::clone(&reactor);
	let listener = Listener::bind(Rc::clone(&reactor), config.listen, move |peer| {
		Session::builder(Rc::clone(&sessions))
			.config(session.clone())
			.service(Rc::clone(&service))
			.label(peer.to_string())
	})
	.with_context(|| format!("listening on {}", config.listen))?;

	info!(
		addr = %listener.local_addr(),
		format = %config.session.format,
		framing = %config.session.framing(),
		"spindle.serve"
	);
	loop {
		reactor.run_once(None)?;
	}
}

fn open(peer: &PeerArgs) -> anyhow::Result<(Rc<dyn Reactor>, Session)> {
	let reactor: Rc<dyn Reactor> = Rc::new(PollReactor::new()?);
	let builder = Session::builder(Rc::clone(&reactor))
		.config(SessionConfig::for_format(peer.format))
		.label("cli");
	let session = connect(peer.connect, builder).with_context(|| format!("connecting to {}", peer.connect))?;
	Ok((reactor, session))
}

fn parse_params(text: &str) -> anyhow::Result<Params> {
	match serde_json::from_str(text).context("params must be JSON")? {
		Value::Array(params) => Ok(params),
		other => bail!("params must be a JSON array, got {other}"),
	}
}

fn call(peer: &PeerArgs, method: &str, params: &str, timeout: Duration) -> anyhow::Result<()> {
	let params = parse_params(params)?;
	let (_reactor, session) = open(peer)?;
	let outcome = session.call(method, params, Some(timeout));
	session.close();
	match outcome {
		Ok(value) => {
			println!("{}", serde_json::to_string_pretty(&value)?);
			Ok(())
		}
		Err(CallError::Application(err)) => {
			let data = err.data.map(|d| format!(" ({d})")).unwrap_or_default();
			bail!("{method} failed with code {}: {}{data}", err.code.0, err.message)
		}
		Err(err) => Err(err).with_context(|| format!("calling {method}")),
	}
}

fn notify(peer: &PeerArgs, method: &str, params: &str) -> anyhow::Result<()> {
	let params = parse_params(params)?;
	let (reactor, session) = open(peer)?;
	session.notify(method, params)?;
	reactor.run_once(Some(Duration::ZERO))?;
	session.close();
	Ok(())
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::prelude::*;

	let filter = || {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			if verbose {
				EnvFilter::new("spindle=trace,debug")
			} else {
				EnvFilter::new("info")
			}
		})
	};

	// SPINDLE_LOG_DIR sends logs to a per-process file instead of stderr.
	if let Some(log_dir) = std::env::var("SPINDLE_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("spindle.{}.log", std::process::id()));
		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_target(true);
			tracing_subscriber::registry().with(filter()).with(file_layer).init();
			tracing::info!(path = ?log_path, "spindle.tracing.file");
			return;
		}
	}

	tracing_subscriber::fmt()
		.with_env_filter(filter())
		.with_writer(std::io::stderr)
		.init();
}
