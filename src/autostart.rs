//! Auto-start of persisted configurations.
//!
//! Run once when the supervisor comes up: entries whose config file has
//! disappeared are pruned from the persisted lists, and every surviving entry is
//! started through the same `Supervisor::start` path the control surface uses.
//! Failures are logged and reported, never retried.

use tokio::task::JoinSet;

use crate::configs::ConfigStore;
use crate::identity::{ConfigIdentity, Role};
use crate::settings::{SettingsError, SettingsStore};
use crate::supervisor::Supervisor;

/// What happened during one auto-start pass.
#[derive(Debug, Default)]
pub struct AutoStartReport {
    pub started: Vec<ConfigIdentity>,
    pub failed: Vec<(ConfigIdentity, String)>,
    pub pruned: Vec<ConfigIdentity>,
}

/// Drops auto-start entries without a backing file and persists the result.
///
/// Returns `(survivors, pruned)`.
pub fn prune_missing(
    configs: &ConfigStore,
    settings: &SettingsStore,
) -> Result<(Vec<ConfigIdentity>, Vec<ConfigIdentity>), SettingsError> {
    let mut current = settings.load()?;
    let mut survivors = Vec::new();
    let mut pruned = Vec::new();
    for role in Role::ALL {
        let removed = current.retain_auto_start(role, |name| {
            configs.exists(&ConfigIdentity::new(role, name))
        });
        for name in removed {
            let identity = ConfigIdentity::new(role, name);
            tracing::warn!(identity = %identity, "auto-start entry has no config file, pruning");
            pruned.push(identity);
        }
        survivors.extend(
            current
                .auto_start(role)
                .iter()
                .map(|name| ConfigIdentity::new(role, name.as_str())),
        );
    }
    if !pruned.is_empty() {
        settings.save(&current)?;
    }
    Ok((survivors, pruned))
}

/// Starts every persisted auto-start configuration in parallel.
pub async fn launch(
    supervisor: &Supervisor,
    configs: &ConfigStore,
    settings: &SettingsStore,
) -> AutoStartReport {
    let mut report = AutoStartReport::default();
    let survivors = match prune_missing(configs, settings) {
        Ok((survivors, pruned)) => {
            report.pruned = pruned;
            survivors
        }
        Err(err) => {
            tracing::warn!(error = %err, "cannot read auto-start list, skipping");
            return report;
        }
    };

    let mut tasks = JoinSet::new();
    for identity in survivors {
        let supervisor = supervisor.clone();
        let path = match configs.path(&identity) {
            Ok(path) => path,
            Err(err) => {
                report.failed.push((identity, err.to_string()));
                continue;
            }
        };
        tasks.spawn(async move {
            let result = supervisor.start(&identity, &path).await;
            (identity, result)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((identity, Ok(()))) => report.started.push(identity),
            Ok((identity, Err(err))) => {
                tracing::warn!(identity = %identity, error = %err, "auto-start failed");
                report.failed.push((identity, err.to_string()));
            }
            Err(err) => tracing::warn!(error = %err, "auto-start task failed"),
        }
    }
    report.started.sort();
    report.failed.sort();
    tracing::info!(
        started = report.started.len(),
        failed = report.failed.len(),
        pruned = report.pruned.len(),
        "auto-start finished"
    );
    report
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::BinarySpec;
    use crate::supervisor::SupervisorOptions;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn options(server: &str) -> SupervisorOptions {
        SupervisorOptions {
            client: BinarySpec::new("/bin/sh"),
            server: BinarySpec::new(server),
            grace_period: Duration::from_millis(500),
            max_log_bytes: 64 * 1024,
        }
    }

    #[tokio::test]
    async fn starts_survivors_and_prunes_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let configs = ConfigStore::new(dir.path());
        configs.prepare().unwrap();
        let settings = SettingsStore::in_dir(dir.path());

        let a = ConfigIdentity::new(Role::Client, "a.toml");
        let b = ConfigIdentity::new(Role::Client, "b.toml");
        std::fs::write(configs.path(&a).unwrap(), "echo a up\nexec sleep 30\n").unwrap();
        std::fs::write(configs.path(&b).unwrap(), "exec sleep 30\n").unwrap();
        settings
            .update(|s| {
                s.set_auto_start(Role::Client, "a.toml", true);
                s.set_auto_start(Role::Client, "b.toml", true);
            })
            .unwrap();
        std::fs::remove_file(configs.path(&b).unwrap()).unwrap();

        let supervisor = Supervisor::new(options("/bin/sh"));
        let report = launch(&supervisor, &configs, &settings).await;

        assert_eq!(report.started, vec![a.clone()]);
        assert_eq!(report.pruned, vec![b.clone()]);
        assert!(report.failed.is_empty());
        assert_eq!(supervisor.running(), BTreeSet::from([a]));
        let persisted = settings.load().unwrap();
        assert!(!persisted.auto_start(Role::Client).contains("b.toml"));
        assert!(persisted.auto_start(Role::Client).contains("a.toml"));

        supervisor.shutdown_all().await;
        assert!(supervisor.running().is_empty());
    }

    #[tokio::test]
    async fn start_failures_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let configs = ConfigStore::new(dir.path());
        configs.prepare().unwrap();
        let settings = SettingsStore::in_dir(dir.path());

        let client = ConfigIdentity::new(Role::Client, "ok.toml");
        let server = ConfigIdentity::new(Role::Server, "edge.toml");
        std::fs::write(configs.path(&client).unwrap(), "exec sleep 30\n").unwrap();
        std::fs::write(configs.path(&server).unwrap(), "bindPort = 7000\n").unwrap();
        settings
            .update(|s| {
                s.set_auto_start(Role::Client, "ok.toml", true);
                s.set_auto_start(Role::Server, "edge.toml", true);
            })
            .unwrap();

        let supervisor = Supervisor::new(options("/nonexistent/frps"));
        let report = launch(&supervisor, &configs, &settings).await;

        assert_eq!(report.started, vec![client.clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, server);
        assert!(supervisor.is_running(&client));
        // Failures do not touch the persisted list.
        assert!(settings.load().unwrap().auto_start(Role::Server).contains("edge.toml"));
        supervisor.shutdown_all().await;
    }

    #[test]
    fn entries_outside_the_role_directory_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let configs = ConfigStore::new(dir.path());
        configs.prepare().unwrap();
        let settings = SettingsStore::in_dir(dir.path());
        let kept = ConfigIdentity::new(Role::Client, "a.toml");
        std::fs::write(configs.path(&kept).unwrap(), "").unwrap();
        settings
            .update(|s| {
                s.set_auto_start(Role::Client, "a.toml", true);
                s.set_auto_start(Role::Client, "../settings.json", true);
            })
            .unwrap();
        assert!(settings.path().is_file());

        let (survivors, pruned) = prune_missing(&configs, &settings).unwrap();
        assert_eq!(survivors, vec![kept]);
        assert_eq!(
            pruned,
            vec![ConfigIdentity::new(Role::Client, "../settings.json")]
        );
        assert!(!settings
            .load()
            .unwrap()
            .auto_start(Role::Client)
            .contains("../settings.json"));
    }

    #[test]
    fn unreadable_settings_prune_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let configs = ConfigStore::new(dir.path());
        let settings = SettingsStore::in_dir(dir.path());
        std::fs::write(settings.path(), "[]").unwrap();
        assert!(prune_missing(&configs, &settings).is_err());
    }
}
