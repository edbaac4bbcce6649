use crate::error::{ProbeError, ProbeResult};

/// Host and port parsed from a `host:port` probe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketTarget {
    pub host: String,
    pub port: u16,
}

impl SocketTarget {
    /// Joins the parts back into a form `tokio::net::lookup_host` accepts.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Splits `host:port`, `[v6]:port`.
///
/// # Errors
///
/// Returns an error when the port is missing or not a valid `u16`, or the host
/// is empty.
pub fn split_host_port(target: &str) -> ProbeResult<SocketTarget> {
    let trimmed = target.trim();
    let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| ProbeError::InvalidTarget {
            target: target.to_owned(),
            reason: "unterminated IPv6 bracket",
        })?;
        let port = tail.strip_prefix(':').ok_or_else(|| ProbeError::InvalidTarget {
            target: target.to_owned(),
            reason: "missing port",
        })?;
        (host, port)
    } else {
        trimmed
            .rsplit_once(':')
            .ok_or_else(|| ProbeError::InvalidTarget {
                target: target.to_owned(),
                reason: "missing port",
            })?
    };
    if host.is_empty() {
        return Err(ProbeError::InvalidTarget {
            target: target.to_owned(),
            reason: "empty host",
        });
    }
    if host.contains(':') && !trimmed.starts_with('[') {
        return Err(ProbeError::InvalidTarget {
            target: target.to_owned(),
            reason: "IPv6 hosts must be bracketed",
        });
    }
    let port = port.parse::<u16>().map_err(|err| ProbeError::InvalidPort {
        target: target.to_owned(),
        source: err,
    })?;
    Ok(SocketTarget {
        host: host.to_owned(),
        port,
    })
}

/// Drops a trailing `:port` (and IPv6 brackets) so targets of different probe
/// types can be compared by host.
#[must_use]
pub fn strip_port(target: &str) -> &str {
    let trimmed = target.trim();
    if let Some(rest) = trimmed.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match trimmed.rsplit_once(':') {
        // Bare IPv6 literal: more than one colon and no brackets.
        Some((host, _)) if host.contains(':') => trimmed,
        Some((host, port)) if port.chars().all(|ch| ch.is_ascii_digit()) => host,
        Some(_) | None => trimmed,
    }
}
