//! An HTTP/1.1 server with CGI, driven by readiness events.
//!
//! Call it like this:
//!
//!     reactor-httpd -f config.toml
//!
//! The config file is in the [TOML format][toml] because it’s commonly used in
//! the Rust ecosystem. Here is an example:
//!
//! ```toml
//! [listen]
//! port = 8000
//! workers = 1
//!
//! [server]
//! name = "reactor-httpd"
//! keep_alive = true
//! max_body_size = 1048576
//!
//! [[location]]
//! prefix = "/"
//! root = "/etc/reactor-httpd/site"
//! index = "index.html"
//! cgi = { ".sh" = "/bin/sh", ".cgi" = "" }
//! ```
//!
//! This example also serves as the defaults if no config file is provided,
//! or any given key is not present (minus the `cgi` table, which is empty by
//! default). If a key is of the wrong type, the server will bail, so don’t do
//! that.
//!
//! Every worker thread runs its own readiness loop over a shared listening
//! socket. Static files are served for GET and HEAD, and can be replaced with
//! PUT or removed with DELETE. Files matching a location's CGI suffixes are run
//! as CGI/1.1 scripts.
//!
//! [toml]: https://github.com/toml-lang/toml

#[macro_use]
extern crate log;

mod cgi;
mod config;
mod errors;
mod log_util;
mod server;

use crate::config::parser::{self, parse_file};
use crate::server::serve;

use clap::{App, Arg};
use log::LevelFilter;

use std::env;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::process::exit;

fn main() {
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(LevelFilter::Info);

    if let Ok(var) = env::var("SERVER_LOG") {
        log_builder.parse_filters(&var);
    }

    if let Err(e) = log_builder.try_init() {
        eprintln!("reactor-httpd: Error when initializing logging: {}", e);
        exit(1);
    }

    let matches = App::new("reactor-httpd")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Alex Hill <alexander.d.hill.89@gmail.com>")
        .arg(Arg::with_name("config_file")
             .short("f")
             .value_name("FILE")
             .help("The TOML file with server configuration")
             .takes_value(true))
        .get_matches();

    let config_file = matches
        .value_of_os("config_file")
        .unwrap_or_else(|| OsStr::from_bytes(b"/etc/reactor-httpd/config.toml"));

    let config = match parse_file(config_file) {
        Ok(c) => c,
        Err(parser::Error::Io(e)) => {
            error!("Error opening config file {:?}: {}", config_file, e);
            exit(1);
        }
        Err(parser::Error::Parse(e)) => {
            error!("Errors parsing config file {:?}", config_file);
            for error in e {
                error!("Config file error at line {} column {}: {}",
                       error.line, error.column, error.desc);
            }
            exit(1);
        }
        Err(parser::Error::Validation(message)) => {
            error!("Error in config file: {}", message);
            exit(1);
        }
    };

    info!("Starting server on port {} with {} worker(s)", config.port, config.workers);
    if let Err(e) = serve(config) {
        error!("Server stopped: {:?}", e);
        exit(1);
    }
}
