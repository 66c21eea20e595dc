use crate::config::ServiceSpec;
use crate::error::SupervisorError;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::info;

/// Loopback address every service is told to bind
pub const SERVICE_HOST: &str = "127.0.0.1";

/// Build the command for a service without spawning it
pub fn build_command(spec: &ServiceSpec, shared_env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);

    if let Some(ref working_dir) = spec.working_dir {
        cmd.current_dir(working_dir);
    }

    for (key, value) in shared_env {
        cmd.env(key, value);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    // Always win over configured values
    cmd.env("PORT", spec.port.to_string());
    cmd.env("HOSTNAME", SERVICE_HOST);

    // Own process group: terminal signals reach only the supervisor, and a
    // kill takes down wrapper scripts together with what they started.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

/// Spawn a service process. Returns as soon as the process exists.
pub fn launch(
    spec: &ServiceSpec,
    shared_env: &HashMap<String, String>,
) -> Result<Child, SupervisorError> {
    info!(service = %spec.name, command = %spec.command, port = spec.port, "Launching service");

    let child = build_command(spec, shared_env)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            service: spec.name.clone(),
            source,
        })?;

    let pid = child.id().unwrap_or(0);
    info!(service = %spec.name, pid, "Service process spawned");
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn env_of(cmd: &Command) -> HashMap<String, String> {
        cmd.as_std()
            .get_envs()
            .filter_map(|(k, v)| {
                Some((
                    k.to_string_lossy().into_owned(),
                    v?.to_string_lossy().into_owned(),
                ))
            })
            .collect()
    }

    #[test]
    fn test_command_environment() {
        let spec = ServiceSpec::new("admin", "node", 3001)
            .with_args(&["server.js"])
            .with_env("NODE_ENV", "development")
            .with_env("PORT", "9999");
        let mut shared = HashMap::new();
        shared.insert("NODE_ENV".to_string(), "production".to_string());
        shared.insert("TZ".to_string(), "UTC".to_string());

        let cmd = build_command(&spec, &shared);
        let env = env_of(&cmd);

        assert_eq!(env.get("PORT"), Some(&"3001".to_string()));
        assert_eq!(env.get("HOSTNAME"), Some(&"127.0.0.1".to_string()));
        assert_eq!(env.get("NODE_ENV"), Some(&"development".to_string()));
        assert_eq!(env.get("TZ"), Some(&"UTC".to_string()));

        assert_eq!(cmd.as_std().get_program(), OsStr::new("node"));
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, vec![OsStr::new("server.js")]);
    }

    #[test]
    fn test_working_dir() {
        let mut spec = ServiceSpec::new("client", "node", 3003);
        spec.working_dir = Some("/srv/client".to_string());

        let cmd = build_command(&spec, &HashMap::new());
        assert_eq!(
            cmd.as_std().get_current_dir(),
            Some(std::path::Path::new("/srv/client"))
        );
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let spec = ServiceSpec::new("admin", "/nonexistent/gatehouse-test-binary", 3001);

        let err = launch(&spec, &HashMap::new()).unwrap_err();
        match err {
            SupervisorError::Spawn { service, source } => {
                assert_eq!(service, "admin");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_passes_port() {
        let spec = ServiceSpec::new("client", "sh", 3456)
            .with_args(&["-c", "test \"$PORT\" = 3456 && test \"$HOSTNAME\" = 127.0.0.1"]);

        let mut child = launch(&spec, &HashMap::new()).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
