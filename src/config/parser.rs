use super::*;
use toml::Value;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

pub fn parse_file<P: AsRef<Path>>(conf: P) -> Result<Config, Error> {
    let mut toml = String::new();
    {
        let mut f = File::open(conf)?;
        f.read_to_string(&mut toml)?;
    }

    parse_str(&toml)
}

pub fn parse_str(toml: &str) -> Result<Config, Error> {
    match toml.parse::<Value>() {
        Ok(table) => config_from_table(table),
        Err(e) => {
            let (line, column) = e.line_col().unwrap_or((0, 0));
            Err(Error::Parse(vec![ErrorMessage {
                desc: e.to_string(),
                line: line + 1,
                column: column + 1,
            }]))
        }
    }
}

/// Walks a dotted path like `"listen.port"` through nested tables.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

fn config_from_table(table: Value) -> Result<Config, Error> {
    let mut config: Config = Default::default();

    match lookup(&table, "listen.port") {
        Some(&Value::Integer(p)) if p <= u16::MAX as i64 && p > 0 => config.port = p as u16,
        Some(&Value::Integer(p)) => {
            return Err(Error::Validation(format!(
                "The given port {} is out of range",
                p
            )))
        }
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected the port to be an integer, got a {}",
                val.type_str()
            )))
        }
        None => (),
    }

    match lookup(&table, "listen.workers") {
        Some(&Value::Integer(n)) if n >= 1 && n <= 1024 => config.workers = n as usize,
        Some(&Value::Integer(n)) => {
            return Err(Error::Validation(format!(
                "The worker count {} is out of range",
                n
            )))
        }
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected the worker count to be an integer, got a {}",
                val.type_str()
            )))
        }
        None => (),
    }

    match lookup(&table, "server.name") {
        Some(&Value::String(ref name)) if !name.is_empty() => config.server.name = name.clone(),
        Some(&Value::String(_)) => {
            return Err(Error::Validation(String::from(
                "The server name must not be empty",
            )))
        }
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected the server name to be a string, got a {}",
                val.type_str()
            )))
        }
        None => (),
    }

    match lookup(&table, "server.keep_alive") {
        Some(&Value::Boolean(b)) => config.server.keep_alive = b,
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected keep_alive to be a boolean, got a {}",
                val.type_str()
            )))
        }
        None => (),
    }

    match lookup(&table, "server.max_body_size") {
        Some(&Value::Integer(n)) if n >= 0 => config.server.max_body_size = n as usize,
        Some(&Value::Integer(n)) => {
            return Err(Error::Validation(format!(
                "The max_body_size {} is negative",
                n
            )))
        }
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected max_body_size to be an integer, got a {}",
                val.type_str()
            )))
        }
        None => (),
    }

    match table.get("location") {
        Some(&Value::Array(ref entries)) if !entries.is_empty() => {
            config.locations = entries
                .iter()
                .enumerate()
                .map(|(i, entry)| location_from_value(i, entry))
                .collect::<Result<_, _>>()?;
        }
        Some(&Value::Array(_)) | None => (),
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected [[location]] tables, got a {}",
                val.type_str()
            )))
        }
    }

    Ok(config)
}

fn location_from_value(index: usize, entry: &Value) -> Result<LocationConfig, Error> {
    let mut location: LocationConfig = Default::default();

    if !entry.is_table() {
        return Err(Error::Validation(format!(
            "Expected location {} to be a table, got a {}",
            index,
            entry.type_str()
        )));
    }

    match entry.get("prefix") {
        Some(&Value::String(ref prefix)) if prefix.starts_with('/') => {
            location.prefix = PathBuf::from(prefix)
        }
        Some(&Value::String(ref prefix)) => {
            return Err(Error::Validation(format!(
                "Location prefix {:?} must start with '/'",
                prefix
            )))
        }
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected the prefix of location {} to be a string, got a {}",
                index,
                val.type_str()
            )))
        }
        None => (),
    }

    match entry.get("root") {
        Some(&Value::String(ref path)) => location.root = PathBuf::from(path),
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected the root of location {} to be a string, got a {}",
                index,
                val.type_str()
            )))
        }
        None => (),
    }

    match entry.get("index") {
        Some(&Value::String(ref name)) if !name.contains('/') => location.index = name.clone(),
        Some(&Value::String(ref name)) => {
            return Err(Error::Validation(format!(
                "Index file {:?} must be a plain file name",
                name
            )))
        }
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected the index of location {} to be a string, got a {}",
                index,
                val.type_str()
            )))
        }
        None => (),
    }

    match entry.get("cgi") {
        Some(&Value::Table(ref rules)) => {
            for (suffix, interpreter) in rules {
                let interpreter = match *interpreter {
                    Value::String(ref s) if s.is_empty() => None,
                    Value::String(ref s) => Some(PathBuf::from(s)),
                    ref val => {
                        return Err(Error::Validation(format!(
                            "Expected the interpreter for {:?} to be a string, got a {}",
                            suffix,
                            val.type_str()
                        )))
                    }
                };
                location.cgi.push(CgiRule {
                    suffix: suffix.clone(),
                    interpreter,
                });
            }
        }
        Some(val) => {
            return Err(Error::Validation(format!(
                "Expected the cgi rules of location {} to be a table, got a {}",
                index,
                val.type_str()
            )))
        }
        None => (),
    }

    Ok(location)
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(Vec<ErrorMessage>),
    Validation(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

/// An owned, rendered version of a TOML syntax error
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub desc: String,
    pub line: usize,
    pub column: usize,
}
