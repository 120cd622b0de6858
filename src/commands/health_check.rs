//! `health-check`: wait until a linked service accepts TCP connections.
//!
//! The address comes from any `*_TCP_ADDR` variable and the ports from every
//! `*_TCP_PORT` variable, as set for linked service containers. Each port is
//! probed on its own thread; the first successful connect ends the wait.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;

use super::Context;
use crate::error::{HelperError, HelperResult};

/// Pause between connection attempts on one port.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, clap::Args)]
pub struct HealthCheck {}

/// Address and ports found in the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub addr: String,
    pub ports: Vec<String>,
}

impl HealthCheck {
    pub fn execute(&self, _ctx: &Context) -> HelperResult<()> {
        let target = discover(std::env::vars())?;
        wait_for_any(&target, PROBE_INTERVAL)
    }
}

/// Find the service address and ports among `vars`.
pub fn discover<I>(vars: I) -> HelperResult<Target>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut addr = None;
    let mut ports = Vec::new();
    for (key, value) in vars {
        if key.ends_with("_TCP_ADDR") {
            addr = Some(value);
        } else if key.ends_with("_TCP_PORT") {
            ports.push(value);
        }
    }

    let addr = addr
        .filter(|a| !a.is_empty())
        .ok_or_else(|| HelperError::InvalidInput("no HOST defined".into()))?;
    if ports.is_empty() {
        return Err(HelperError::InvalidInput("no PORT defined".into()));
    }
    ports.sort();
    ports.dedup();
    Ok(Target { addr, ports })
}

/// Block until one of the target's ports accepts a connection.
pub fn wait_for_any(target: &Target, interval: Duration) -> HelperResult<()> {
    tracing::info!("waiting for TCP connection to {} on {:?}...", target.addr, target.ports);

    let (tx, rx) = bounded::<String>(target.ports.len());
    for port in &target.ports {
        let host = format!("{}:{}", target.addr, port);
        let tx = tx.clone();
        thread::spawn(move || loop {
            if try_connect(&host) {
                let _ = tx.send(host);
                return;
            }
            thread::sleep(interval);
        });
    }
    drop(tx);

    match rx.recv() {
        Ok(host) => {
            tracing::info!("{host} is available");
            Ok(())
        }
        Err(_) => Err(HelperError::Failed("all probes stopped".into())),
    }
}

fn try_connect(host: &str) -> bool {
    let addrs: Vec<SocketAddr> = match host.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            tracing::debug!(host, error = %e, "resolve failed");
            return false;
        }
    };
    addrs
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, CONNECT_TIMEOUT).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_discover() {
        let target = discover(vars(&[
            ("PATH", "/bin"),
            ("DB_PORT_5432_TCP_ADDR", "10.0.0.2"),
            ("DB_PORT_5432_TCP_PORT", "5432"),
            ("DB_PORT_5433_TCP_PORT", "5433"),
        ]))
        .unwrap();
        assert_eq!(target.addr, "10.0.0.2");
        assert_eq!(target.ports, vec!["5432", "5433"]);
    }

    #[test]
    fn test_missing_address_or_port() {
        let err = discover(vars(&[("X_TCP_PORT", "80")])).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
        let err = discover(vars(&[("X_TCP_ADDR", "localhost")])).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_first_open_port_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let open = listener.local_addr().unwrap().port().to_string();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port().to_string()
        };

        let target = Target {
            addr: "127.0.0.1".into(),
            ports: vec![closed, open],
        };
        wait_for_any(&target, Duration::from_millis(10)).unwrap();
    }
}
