pub mod parser;

use std::path::PathBuf;

/// A holder for app configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port number to listen on
    pub port: u16,
    /// Number of reactor threads sharing the listening socket
    pub workers: usize,
    pub server: ServerConfig,
    pub locations: Vec<LocationConfig>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 8000,
            workers: 1,
            server: Default::default(),
            locations: vec![Default::default()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Value of the `Server` header on every response
    pub name: String,
    pub keep_alive: bool,
    /// Largest request body accepted, in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            name: String::from("reactor-httpd"),
            keep_alive: true,
            max_body_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    /// Public URI prefix that gets mapped onto `root`
    pub prefix: PathBuf,
    /// Where the files are located on disk
    pub root: PathBuf,
    /// File served when the request names a directory
    pub index: String,
    pub cgi: Vec<CgiRule>,
}

impl Default for LocationConfig {
    fn default() -> LocationConfig {
        LocationConfig {
            prefix: PathBuf::from("/"),
            root: PathBuf::from("/etc/reactor-httpd/site"),
            index: String::from("index.html"),
            cgi: Vec::new(),
        }
    }
}

/// Files whose name ends in `suffix` are run as CGI scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiRule {
    pub suffix: String,
    /// `None` executes the script itself.
    pub interpreter: Option<PathBuf>,
}
