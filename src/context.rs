//! Execution context for external tools.
//!
//! Credentials, profile and region are carried explicitly and applied to
//! each subprocess, never written into this process's environment.

use std::ffi::OsStr;
use std::process::Command;

use crate::config::Config;

/// Environment handed to `aws`, `rclone`, and `eb` subprocesses.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub region: String,
    env: Vec<(String, String)>,
}

impl Context {
    pub fn from_config(config: &Config) -> Self {
        let mut ctx = Self {
            region: config.aws_region.clone(),
            env: Vec::new(),
        };

        if let Some(profile) = &config.aws_profile {
            ctx.set("AWS_PROFILE", profile);
            ctx.set("RCLONE_S3_PROFILE", profile);
        }
        ctx.set("AWS_REGION", &config.aws_region);
        ctx.set("RCLONE_S3_PROVIDER", "AWS");
        ctx.set("RCLONE_S3_ENV_AUTH", "true");
        ctx.set("RCLONE_S3_REGION", &config.aws_region);
        ctx.set("RCLONE_S3_LOCATION_CONSTRAINT", &config.aws_region);
        ctx.set("RCLONE_S3_REQUESTER_PAYS", "true");
        ctx
    }

    /// Set or replace one variable.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.env.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.env.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// A command for `program` with this context's environment applied.
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut cmd = Command::new(program);
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_and_region_reach_both_tools() {
        let config = Config {
            aws_profile: Some("builder".into()),
            aws_region: "us-east-2".into(),
            ..Config::default()
        };
        let ctx = Context::from_config(&config);
        assert_eq!(ctx.get("AWS_PROFILE"), Some("builder"));
        assert_eq!(ctx.get("RCLONE_S3_PROFILE"), Some("builder"));
        assert_eq!(ctx.get("RCLONE_S3_REGION"), Some("us-east-2"));
        assert_eq!(ctx.get("RCLONE_S3_REQUESTER_PAYS"), Some("true"));
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut ctx = Context::default();
        ctx.set("A", "1");
        ctx.set("A", "2");
        assert_eq!(ctx.get("A"), Some("2"));
    }

    #[test]
    fn command_carries_environment() {
        let mut ctx = Context::default();
        ctx.set("EBFLEET_TEST", "yes");
        let cmd = ctx.command("true");
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(
            envs.iter()
                .any(|(k, v)| *k == "EBFLEET_TEST" && *v == Some(OsStr::new("yes")))
        );
    }
}
