// SPDX-License-Identifier: BSD-3-Clause

use clap::Parser;

use ftpd::config::{self, Config};
use ftpd::Server;

#[derive(Parser)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Anonymous-login username; empty allows any username.
    #[arg(long, default_value = "")]
    user: String,

    /// Anonymous-login password; empty allows any password.
    #[arg(long, default_value = "")]
    pass: String,

    /// Load configuration from this file, overriding the other flags.
    #[arg(long)]
    config: Option<String>,
}

fn main() {
    env_logger::init();

    let args = Cli::parse();

    let cfg = match args.config {
        Some(path) => match Config::load(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("failed to load {path}: {e}");
                std::process::exit(1);
            }
        },
        None => Config::new(args.user, args.pass, args.port),
    };

    let shared = config::shared(cfg);

    let mut server = match Server::new(shared) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("failed to start server: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
