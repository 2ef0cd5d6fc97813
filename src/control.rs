//! Line-oriented control surface for a running supervisor.
//!
//! While `tunnelrack run` is active, each stdin line is parsed into a
//! `ControlCommand` and executed against the supervisor. Replies go to stderr so
//! stdout stays the tunnel log.

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::configs::ConfigStore;
use crate::identity::{ConfigIdentity, Role};
use crate::supervisor::Supervisor;

const HELP: &str = "commands:
  start ROLE FILE   start a configuration (ROLE is client or server)
  stop ROLE FILE    stop a configuration
  running           show running configurations
  list              show all configurations
  clear             clear the log
  quit              stop everything and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start(ConfigIdentity),
    Stop(ConfigIdentity),
    Running,
    List,
    Clear,
    Help,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ControlCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "start" => ControlCommand::Start(parse_identity(rest)?),
        "stop" => ControlCommand::Stop(parse_identity(rest)?),
        "running" | "ps" => ControlCommand::Running,
        "list" | "ls" => ControlCommand::List,
        "clear" => ControlCommand::Clear,
        "help" | "?" => ControlCommand::Help,
        "quit" | "exit" => ControlCommand::Quit,
        other => bail!("unknown command `{}` (try `help`)", other),
    };
    Ok(Some(command))
}

// Accepts `ROLE FILE` or `ROLE:FILE`; file names may contain spaces.
fn parse_identity(rest: &str) -> Result<ConfigIdentity> {
    if let Some((role, _)) = rest.split_once(':') {
        if role.parse::<Role>().is_ok() {
            return rest.parse();
        }
    }
    let (role, file) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| anyhow!("expected ROLE FILE"))?;
    let file = file.trim();
    if file.is_empty() {
        bail!("expected ROLE FILE");
    }
    ConfigIdentity::try_new(role.parse()?, file)
}

/// Executes `command`; returns whether the caller should shut down.
pub async fn execute(
    command: ControlCommand,
    supervisor: &Supervisor,
    configs: &ConfigStore,
) -> Result<Flow> {
    match command {
        ControlCommand::Start(identity) => {
            let path = configs.path(&identity)?;
            if !path.is_file() {
                bail!("no config file at {}", path.display());
            }
            supervisor.start(&identity, &path).await?;
        }
        ControlCommand::Stop(identity) => supervisor.stop(&identity).await?,
        ControlCommand::Running => {
            let running = supervisor.running();
            if running.is_empty() {
                eprintln!("nothing running");
            }
            for identity in running {
                match supervisor.info(&identity).await {
                    Some(info) => eprintln!(
                        "{} pid={} up={}s",
                        info.identity,
                        info.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into()),
                        info.uptime.as_secs()
                    ),
                    None => eprintln!("{}", identity),
                }
            }
        }
        ControlCommand::List => {
            for role in Role::ALL {
                for identity in configs.list(role)? {
                    let mark = if supervisor.is_running(&identity) { "*" } else { " " };
                    eprintln!("{} {}", mark, identity);
                }
            }
        }
        ControlCommand::Clear => supervisor.log().clear(),
        ControlCommand::Help => eprintln!("{}", HELP),
        ControlCommand::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

/// Forwards parsed stdin lines to `tx`. End of input only ends the listener.
pub fn spawn_stdin_listener(tx: mpsc::Sender<ControlCommand>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_command(&line) {
                Ok(Some(command)) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => eprintln!("{}", err),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("   ").unwrap(), None);
        assert_eq!(parse_command("running").unwrap(), Some(ControlCommand::Running));
        assert_eq!(parse_command("QUIT").unwrap(), Some(ControlCommand::Quit));
        assert_eq!(
            parse_command("start client home.toml").unwrap(),
            Some(ControlCommand::Start(ConfigIdentity::new(Role::Client, "home.toml")))
        );
        assert_eq!(
            parse_command("stop frps:edge.toml").unwrap(),
            Some(ControlCommand::Stop(ConfigIdentity::new(Role::Server, "edge.toml")))
        );
        assert!(parse_command("start client").is_err());
        assert!(parse_command("restart client a.toml").is_err());
    }

    #[test]
    fn file_names_may_contain_spaces_and_colons() {
        assert_eq!(
            parse_command("start client 2024-05-01 12.30.00.toml").unwrap(),
            Some(ControlCommand::Start(ConfigIdentity::new(
                Role::Client,
                "2024-05-01 12.30.00.toml"
            )))
        );
        assert_eq!(
            parse_command("stop server 10:00.toml").unwrap(),
            Some(ControlCommand::Stop(ConfigIdentity::new(Role::Server, "10:00.toml")))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn executes_against_supervisor() {
        use crate::process::BinarySpec;
        use crate::supervisor::SupervisorOptions;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let configs = ConfigStore::new(dir.path());
        configs.prepare().unwrap();
        let id = ConfigIdentity::new(Role::Client, "a.toml");
        std::fs::write(configs.path(&id).unwrap(), "echo hello\nexec sleep 30\n").unwrap();
        let supervisor = Supervisor::new(SupervisorOptions {
            client: BinarySpec::new("/bin/sh"),
            server: BinarySpec::new("/bin/sh"),
            grace_period: Duration::from_secs(1),
            max_log_bytes: 4096,
        });

        let flow = execute(ControlCommand::Start(id.clone()), &supervisor, &configs)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(supervisor.is_running(&id));

        let missing = ConfigIdentity::new(Role::Server, "missing.toml");
        assert!(execute(ControlCommand::Start(missing), &supervisor, &configs)
            .await
            .is_err());

        execute(ControlCommand::Stop(id.clone()), &supervisor, &configs)
            .await
            .unwrap();
        assert!(!supervisor.is_running(&id));
        assert!(supervisor.log().text().contains("hello"));

        execute(ControlCommand::Clear, &supervisor, &configs).await.unwrap();
        assert!(supervisor.log().text().is_empty());
        assert_eq!(
            execute(ControlCommand::Quit, &supervisor, &configs).await.unwrap(),
            Flow::Quit
        );
    }
}
