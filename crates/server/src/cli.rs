use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use spindle_rpc::WireFormat;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(about = "Reentrant RPC sessions over TCP")]
#[command(version)]
pub struct Cli {
	/// Verbose logging
	#[arg(short, long, global = true)]
	pub verbose: bool,

	/// Subcommand to execute.
	#[command(subcommand)]
	pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
	/// Serve the demo service
	Serve {
		/// Address to listen on (overrides the config file)
		#[arg(short, long, value_name = "ADDR")]
		listen: Option<SocketAddr>,

		/// Wire format (overrides the config file)
		#[arg(short, long)]
		format: Option<WireFormat>,

		/// TOML configuration file
		#[arg(short, long, value_name = "PATH")]
		config: Option<PathBuf>,
	},
	/// Call a method and print its result as JSON
	Call {
		/// Connection settings.
		#[command(flatten)]
		peer: PeerArgs,

		/// Method name
		method: String,

		/// Positional parameters as a JSON array
		#[arg(default_value = "[]")]
		params: String,

		/// Give up after this many milliseconds
		#[arg(long, value_name = "MS", default_value_t = 5000)]
		timeout_ms: u64,
	},
	/// Send a notification
	Notify {
		/// Connection settings.
		#[command(flatten)]
		peer: PeerArgs,

		/// Method name
		method: String,

		/// Positional parameters as a JSON array
		#[arg(default_value = "[]")]
		params: String,
	},
}

/// Where and how to reach a server.
#[derive(Args, Debug)]
pub struct PeerArgs {
	/// Server address
	#[arg(long, value_name = "ADDR", default_value = "127.0.0.1:7878")]
	pub connect: SocketAddr,

	/// Wire format the server speaks
	#[arg(short, long, default_value_t = WireFormat::MsgPack)]
	pub format: WireFormat,
}
