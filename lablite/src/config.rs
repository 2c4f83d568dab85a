//! Service configuration, read once from the environment at startup.
//!
//! Misconfiguration is fatal: [`Config::from_env`] fails fast rather than
//! letting the service come up with a broken auth key or TTL.

use std::env;
use thiserror::Error;

/// Hard ceiling on session TTL, in minutes.
pub const MAX_TTL_MINUTES: u32 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Shared secret required on every API request.
    pub api_key: String,
    pub docker_socket: String,
    pub default_ttl_minutes: u32,
    pub max_sessions_per_user: usize,
    pub sandbox_memory_limit: String,
    pub sandbox_cpu_limit: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env::var("LAB_SERVICE_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("LAB_SERVICE_API_KEY"))?;

        let port = parse_var("PORT", 4000u16)?;
        let default_ttl_minutes = parse_var("DEFAULT_TTL_MINUTES", 60u32)?;
        if !(1..=MAX_TTL_MINUTES).contains(&default_ttl_minutes) {
            return Err(ConfigError::Invalid {
                name: "DEFAULT_TTL_MINUTES",
                reason: format!("must be between 1 and {MAX_TTL_MINUTES}"),
            });
        }

        let max_sessions_per_user = parse_var("MAX_CONCURRENT_SESSIONS_PER_USER", 1usize)?;
        if max_sessions_per_user == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_CONCURRENT_SESSIONS_PER_USER",
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            api_key,
            docker_socket: env::var("DOCKER_SOCKET")
                .unwrap_or_else(|_| "/var/run/docker.sock".into()),
            default_ttl_minutes,
            max_sessions_per_user,
            sandbox_memory_limit: env::var("SANDBOX_MEMORY_LIMIT")
                .unwrap_or_else(|_| "512m".into()),
            sandbox_cpu_limit: env::var("SANDBOX_CPU_LIMIT").unwrap_or_else(|_| "1.0".into()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize these tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear() {
        for name in [
            "LAB_SERVICE_API_KEY",
            "PORT",
            "HOST",
            "DOCKER_SOCKET",
            "DEFAULT_TTL_MINUTES",
            "MAX_CONCURRENT_SESSIONS_PER_USER",
            "SANDBOX_MEMORY_LIMIT",
            "SANDBOX_CPU_LIMIT",
            "LOG_LEVEL",
        ] {
            unsafe { env::remove_var(name) };
        }
    }

    #[test]
    fn defaults_apply_when_only_the_key_is_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        unsafe { env::set_var("LAB_SERVICE_API_KEY", "secret") };

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.default_ttl_minutes, 60);
        assert_eq!(config.max_sessions_per_user, 1);
        assert_eq!(config.sandbox_memory_limit, "512m");
        assert_eq!(config.docker_socket, "/var/run/docker.sock");
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Missing("LAB_SERVICE_API_KEY")
        ));
    }

    #[test]
    fn blank_api_key_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        unsafe { env::set_var("LAB_SERVICE_API_KEY", "   ") };
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn ttl_outside_the_cap_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        unsafe {
            env::set_var("LAB_SERVICE_API_KEY", "secret");
            env::set_var("DEFAULT_TTL_MINUTES", "500");
        }
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn zero_session_cap_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        unsafe {
            env::set_var("LAB_SERVICE_API_KEY", "secret");
            env::set_var("MAX_CONCURRENT_SESSIONS_PER_USER", "0");
        }
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn unparseable_port_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        unsafe {
            env::set_var("LAB_SERVICE_API_KEY", "secret");
            env::set_var("PORT", "not-a-port");
        }
        assert!(Config::from_env().is_err());
    }
}
