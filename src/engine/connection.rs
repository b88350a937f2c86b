//! Socket resolution and container engine connection.
//!
//! Resolves the engine socket from explicit configuration, fallback
//! environment variables, or the platform default, then connects with
//! `bollard` and verifies the engine responds before the pool starts
//! creating containers.

use std::time::Duration;

use bollard::Docker;

use crate::error::{ContainerError, SandcastleError};

/// Environment variable names checked in fallback order after configuration.
const FALLBACK_ENV_VARS: &[&str] = &["DOCKER_HOST", "CONTAINER_HOST", "PODMAN_HOST"];

/// Connection timeout in seconds for engine API connections.
const CONNECTION_TIMEOUT_SECS: u64 = 120;

/// Timeout in seconds for the connect-time health check.
const HEALTH_CHECK_TIMEOUT_SECS: u64 = 10;

/// Default socket path for Unix platforms.
#[cfg(unix)]
const DEFAULT_SOCKET: &str = "unix:///var/run/docker.sock";

/// Default socket path for Windows platforms.
#[cfg(windows)]
const DEFAULT_SOCKET: &str = "npipe:////./pipe/docker_engine";

/// Resolves engine socket endpoints from environment variables.
///
/// The environment is accessed through `mockable::Env` so resolution order
/// can be tested without mutating process state.
pub struct SocketResolver<'a, E: mockable::Env> {
    env: &'a E,
}

impl<'a, E: mockable::Env> SocketResolver<'a, E> {
    /// Creates a new socket resolver with the given environment provider.
    #[must_use]
    pub const fn new(env: &'a E) -> Self {
        Self { env }
    }

    /// Resolves the socket endpoint from fallback environment variables,
    /// checking `DOCKER_HOST`, `CONTAINER_HOST`, then `PODMAN_HOST`.
    #[must_use]
    pub fn resolve_from_env(&self) -> Option<String> {
        FALLBACK_ENV_VARS
            .iter()
            .filter_map(|var_name| self.env.string(var_name))
            .find(|value| !value.is_empty())
    }

    /// Returns the platform default socket path.
    #[must_use]
    pub const fn default_socket() -> &'static str {
        DEFAULT_SOCKET
    }
}

/// Resolve the socket endpoint without establishing a connection.
///
/// Resolution order: explicit `config_socket`, then the resolver's fallback
/// environment variables, then the platform default.
#[must_use]
pub fn resolve_socket<E: mockable::Env>(
    config_socket: Option<&str>,
    resolver: &SocketResolver<'_, E>,
) -> String {
    config_socket
        .filter(|socket| !socket.is_empty())
        .map(String::from)
        .or_else(|| resolver.resolve_from_env())
        .unwrap_or_else(|| SocketResolver::<E>::default_socket().to_owned())
}

/// Connect to the engine at `socket` and verify it responds to a ping.
///
/// Supports `unix://`, `npipe://`, `tcp://` (rewritten to HTTP), `http://`,
/// `https://`, and bare paths (classified by syntax, not platform).
///
/// # Errors
///
/// Returns `ContainerError::ConnectionFailed` when the connection cannot be
/// established and `ContainerError::HealthCheckFailed` when the engine does
/// not answer the ping within its timeout.
pub async fn connect(socket: &str) -> Result<Docker, SandcastleError> {
    let docker = establish(socket)?;
    ping_with_timeout(&docker).await?;
    Ok(docker)
}

/// Connect using the resolved socket from configuration and environment.
///
/// # Errors
///
/// Returns the same errors as [`connect`].
pub async fn connect_with_fallback<E: mockable::Env>(
    config_socket: Option<&str>,
    resolver: &SocketResolver<'_, E>,
) -> Result<Docker, SandcastleError> {
    let socket = resolve_socket(config_socket, resolver);
    connect(&socket).await
}

/// Classifies socket endpoint types for connection handling.
enum SocketType {
    /// Unix socket or Windows named pipe with explicit scheme.
    Socket,
    /// HTTP, HTTPS, or TCP endpoint (TCP is rewritten to HTTP).
    Http,
    /// Bare path without scheme prefix.
    BarePath,
}

impl SocketType {
    fn classify(socket: &str) -> Self {
        if socket.starts_with("unix://") || socket.starts_with("npipe://") {
            Self::Socket
        } else if socket.starts_with("tcp://")
            || socket.starts_with("http://")
            || socket.starts_with("https://")
        {
            Self::Http
        } else {
            Self::BarePath
        }
    }
}

fn establish(socket: &str) -> Result<Docker, SandcastleError> {
    let connected = match SocketType::classify(socket) {
        SocketType::Socket => Docker::connect_with_socket(
            socket,
            CONNECTION_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        ),
        SocketType::Http => {
            let http_socket = if socket.starts_with("tcp://") {
                socket.replacen("tcp://", "http://", 1)
            } else {
                socket.to_owned()
            };
            Docker::connect_with_http(
                &http_socket,
                CONNECTION_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )
        }
        SocketType::BarePath => {
            let socket_uri = normalize_bare_path(socket);
            Docker::connect_with_socket(
                &socket_uri,
                CONNECTION_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )
        }
    };

    connected.map_err(|error| {
        SandcastleError::from(ContainerError::ConnectionFailed {
            message: error.to_string(),
        })
    })
}

/// Normalize a bare socket path to a URI with the appropriate scheme.
///
/// Paths starting with `\\` or `//` are assumed to be Windows named pipes;
/// all other paths are assumed to be Unix sockets.
fn normalize_bare_path(path: &str) -> String {
    if path.starts_with("\\\\") || path.starts_with("//") {
        format!("npipe://{path}")
    } else {
        format!("unix://{path}")
    }
}

async fn ping_with_timeout(docker: &Docker) -> Result<(), SandcastleError> {
    let timeout = Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS);

    tokio::time::timeout(timeout, docker.ping())
        .await
        .map_err(|_| {
            SandcastleError::from(ContainerError::HealthCheckFailed {
                message: format!("ping timed out after {HEALTH_CHECK_TIMEOUT_SECS} seconds"),
            })
        })?
        .map_err(|error| {
            SandcastleError::from(ContainerError::HealthCheckFailed {
                message: error.to_string(),
            })
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockable::MockEnv;
    use rstest::rstest;

    fn env_with(values: Vec<(&'static str, &'static str)>) -> MockEnv {
        let mut env = MockEnv::new();
        env.expect_string().returning(move |name| {
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| String::from(*value))
        });
        env
    }

    #[rstest]
    fn explicit_socket_wins_over_environment() {
        let env = env_with(vec![("DOCKER_HOST", "unix:///from/env.sock")]);
        let resolver = SocketResolver::new(&env);
        let socket = resolve_socket(Some("unix:///explicit.sock"), &resolver);
        assert_eq!(socket, "unix:///explicit.sock");
    }

    #[rstest]
    fn docker_host_is_checked_before_podman_host() {
        let env = env_with(vec![
            ("DOCKER_HOST", "unix:///docker.sock"),
            ("PODMAN_HOST", "unix:///podman.sock"),
        ]);
        let resolver = SocketResolver::new(&env);
        assert_eq!(
            resolve_socket(None, &resolver),
            String::from("unix:///docker.sock")
        );
    }

    #[rstest]
    fn empty_environment_falls_back_to_platform_default() {
        let env = env_with(vec![]);
        let resolver = SocketResolver::new(&env);
        assert_eq!(
            resolve_socket(None, &resolver),
            SocketResolver::<MockEnv>::default_socket()
        );
    }

    #[rstest]
    #[case("/var/run/docker.sock", "unix:///var/run/docker.sock")]
    #[case("//./pipe/docker_engine", "npipe:////./pipe/docker_engine")]
    fn bare_paths_are_normalized(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_bare_path(input), expected);
    }
}
