// SPDX-License-Identifier: AGPL-3.0
// CryptPort Shell - Command parsing

use cryptport_core::{Endpoint, JobId, Registration, SessionError, SessionResult};
use std::path::PathBuf;

/// Commands accepted on stdin
#[derive(Debug, PartialEq)]
pub enum ShellCommand {
    Help,
    Login { email: String, password: String },
    Register(Registration),
    Logout,
    Connect(Option<Endpoint>),
    Authenticate,
    Open(Option<Endpoint>),
    Disconnect,
    List,
    Upload { path: PathBuf },
    Download { name: String, path: PathBuf },
    Delete { name: String },
    Cancel { id: JobId },
    Jobs,
    History,
    Status,
    Quit,
}

pub const HELP: &str = "\
Commands:
  login <email> <password>
  register <username> <email> <password> <confirm>
  logout
  connect [host [port]]       open the transport only
  auth                        present the login token on the connection
  open [host [port]]          connect and authenticate
  disconnect
  list
  upload <path>
  download <name> [path]
  delete <name>
  cancel <job-id>
  jobs | history | status
  quit";

impl ShellCommand {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> SessionResult<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match (verb, args.as_slice()) {
            ("help" | "?", []) => Self::Help,
            ("login", [email, password]) => Self::Login {
                email: email.to_string(),
                password: password.to_string(),
            },
            ("register", [username, email, password, confirm]) => Self::Register(Registration {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
                confirm: confirm.to_string(),
            }),
            ("logout", []) => Self::Logout,
            ("connect", rest) => Self::Connect(endpoint(rest)?),
            ("auth", []) => Self::Authenticate,
            ("open", rest) => Self::Open(endpoint(rest)?),
            ("disconnect", []) => Self::Disconnect,
            ("list" | "ls", []) => Self::List,
            ("upload", [path]) => Self::Upload {
                path: PathBuf::from(path),
            },
            ("download", [name]) => Self::Download {
                name: name.to_string(),
                path: PathBuf::new(),
            },
            ("download", [name, path]) => Self::Download {
                name: name.to_string(),
                path: PathBuf::from(path),
            },
            ("delete" | "rm", [name]) => Self::Delete {
                name: name.to_string(),
            },
            ("cancel", [id]) => Self::Cancel {
                id: id
                    .parse()
                    .map_err(|_| SessionError::Validation(format!("Not a job id: {}", id)))?,
            },
            ("jobs", []) => Self::Jobs,
            ("history", []) => Self::History,
            ("status", []) => Self::Status,
            ("quit" | "exit", []) => Self::Quit,
            _ => {
                return Err(SessionError::Validation(format!(
                    "Unrecognized command '{}'. Type 'help' for usage.",
                    line.trim()
                )))
            }
        };
        Ok(Some(command))
    }
}

/// Optional `host [port]`; a missing port means 9000
fn endpoint(args: &[&str]) -> SessionResult<Option<Endpoint>> {
    match args {
        [] => Ok(None),
        [host] => Endpoint::parse(host, "9000").map(Some),
        [host, port] => Endpoint::parse(host, port).map(Some),
        _ => Err(SessionError::Validation(
            "Expected [host [port]]".to_string(),
        )),
    }
}
