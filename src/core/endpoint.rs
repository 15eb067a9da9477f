//! Purpose: Parse and render the `host:port` address of a running engine node.
//! Exports: `Endpoint`, `DEFAULT_HOST`, `DEFAULT_PORT`.
//! Role: Immutable connection target held by the client facade.
//! Invariants: Missing host defaults to `localhost`, missing port to 5158.
//! Invariants: Only the `tcp` protocol suffix is accepted.
use crate::core::error::{Error, ErrorKind};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5158;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = if host.is_empty() {
            DEFAULT_HOST.to_string()
        } else {
            host
        };
        Self { host, port }
    }

    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        let address = match trimmed.rsplit_once('/') {
            Some((address, protocol)) => {
                if !protocol.eq_ignore_ascii_case("tcp") {
                    return Err(invalid(input, "unsupported endpoint protocol")
                        .with_hint("Only tcp endpoints are supported, e.g. `localhost:5158/tcp`."));
                }
                address
            }
            None => trimmed,
        };

        if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid(input, "unterminated IPv6 host"))?;
            let port = match tail {
                "" => DEFAULT_PORT,
                tail => match tail.strip_prefix(':') {
                    Some(port) => parse_port(input, port)?,
                    None => return Err(invalid(input, "unexpected text after IPv6 host")),
                },
            };
            return Ok(Self::new(host, port));
        }

        if address.matches(':').count() > 1 {
            return Ok(Self::new(address, DEFAULT_PORT));
        }

        match address.split_once(':') {
            Some((host, port)) => Ok(Self::new(host, parse_port(input, port)?)),
            None => Ok(Self::new(address, DEFAULT_PORT)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16, Error> {
    if port.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    port.parse::<u16>().map_err(|err| {
        invalid(input, "invalid endpoint port")
            .with_hint("Use a port between 0 and 65535.")
            .with_source(err)
    })
}

fn invalid(input: &str, message: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(message)
        .with_input(input)
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_PORT, Endpoint};
    use crate::core::error::ErrorKind;

    #[test]
    fn parses_host_and_port() {
        let endpoint = Endpoint::parse("node.example:42000").expect("endpoint");
        assert_eq!(endpoint.host(), "node.example");
        assert_eq!(endpoint.port(), 42000);
        assert_eq!(endpoint.to_string(), "node.example:42000");
    }

    #[test]
    fn empty_input_uses_defaults() {
        let endpoint = Endpoint::parse("").expect("endpoint");
        assert_eq!(endpoint, Endpoint::default());
        assert_eq!(endpoint.to_string(), "localhost:5158");
    }

    #[test]
    fn port_only_keeps_default_host() {
        let endpoint = Endpoint::parse(":0").expect("endpoint");
        assert_eq!(endpoint.host(), "localhost");
        assert_eq!(endpoint.port(), 0);
    }

    #[test]
    fn host_only_gets_default_port() {
        let endpoint = Endpoint::parse("10.0.0.1").expect("endpoint");
        assert_eq!(endpoint.port(), DEFAULT_PORT);
    }

    #[test]
    fn accepts_tcp_suffix() {
        let endpoint = Endpoint::parse("127.0.0.1:5158/tcp").expect("endpoint");
        assert_eq!(endpoint.to_string(), "127.0.0.1:5158");
    }

    #[test]
    fn rejects_udp_suffix() {
        let err = Endpoint::parse("127.0.0.1:5158/udp").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.input(), Some("127.0.0.1:5158/udp"));
    }

    #[test]
    fn rejects_bad_port() {
        let err = Endpoint::parse("localhost:http").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn bracketed_ipv6_round_trips() {
        let endpoint = Endpoint::parse("[::1]:6000").expect("endpoint");
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.port(), 6000);
        assert_eq!(endpoint.to_string(), "[::1]:6000");
    }

    #[test]
    fn bare_ipv6_uses_default_port() {
        let endpoint = Endpoint::parse("::1").expect("endpoint");
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.port(), DEFAULT_PORT);
    }
}
