//! coordination client configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default coordination ensemble to connect to
    pub static DEFAULT_ZK_HOSTS: &str = "localhost:2181";
    /// Default session timeout in seconds, the ensemble expires the session
    /// if it hears nothing from us within this window
    pub const DEFAULT_SESSION_TIMEOUT: u64 = 10;
    /// default log level. Can use this argument or ZKEM_LOG env var
    pub const DEFAULT_ZKEM_LOG: &str = "info";

    use std::{fmt, str::FromStr, time::Duration};

    pub use clap::Parser;
    use thiserror::Error;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "zkem", bin_name = "zkem", about, long_about = None)]
    /// parses from cli & environment var
    pub struct Config {
        /// ensemble connect string, `host:port[,host:port...][/chroot]`
        #[clap(long, env, value_parser, default_value = DEFAULT_ZK_HOSTS)]
        pub zk_hosts: ConnectString,
        /// session timeout (seconds)
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SESSION_TIMEOUT)]
        pub session_timeout: u64,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_ZKEM_LOG)]
        pub zkem_log: String,
    }

    impl Config {
        /// Session timeout as `Duration`
        pub fn session_timeout(&self) -> Duration {
            Duration::from_secs(self.session_timeout)
        }
    }

    /// Failure to make sense of a connect string
    #[derive(Debug, Error, Clone, PartialEq, Eq)]
    pub enum ConnectStringError {
        /// no `host:port` pairs before the chroot
        #[error("connect string has no hosts")]
        NoHosts,
        /// a host entry without a usable port
        #[error("invalid host entry {0:?}, expected host:port")]
        InvalidHost(String),
        /// chroot must be an absolute path without a trailing slash
        #[error("invalid chroot {0:?}")]
        InvalidChroot(String),
    }

    /// Parsed `host:port[,host:port...][/chroot]`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ConnectString {
        hosts: Vec<String>,
        chroot: Option<String>,
    }

    impl ConnectString {
        /// `host:port` entries in the order given
        pub fn hosts(&self) -> &[String] {
            &self.hosts
        }

        /// chroot every path is relative to, if any
        pub fn chroot(&self) -> Option<&str> {
            self.chroot.as_deref()
        }
    }

    impl FromStr for ConnectString {
        type Err = ConnectStringError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let (hosts, chroot) = match s.find('/') {
                Some(idx) => (&s[..idx], Some(&s[idx..])),
                None => (s, None),
            };
            let chroot = match chroot {
                // "host:2181/" is the same as no chroot at all
                Some("/") | None => None,
                Some(path) if path.ends_with('/') || path.contains("//") => {
                    return Err(ConnectStringError::InvalidChroot(path.to_owned()));
                }
                Some(path) => Some(path.to_owned()),
            };
            let hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(|h| match h.rsplit_once(':') {
                    Some((name, port)) if !name.is_empty() && port.parse::<u16>().is_ok() => {
                        Ok(h.to_owned())
                    }
                    _ => Err(ConnectStringError::InvalidHost(h.to_owned())),
                })
                .collect::<Result<Vec<_>, _>>()?;
            if hosts.is_empty() {
                return Err(ConnectStringError::NoHosts);
            }
            Ok(Self { hosts, chroot })
        }
    }

    impl fmt::Display for ConnectString {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.hosts.join(","))?;
            if let Some(chroot) = &self.chroot {
                write!(f, "{chroot}")?;
            }
            Ok(())
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::{Context, Result};
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for the global tracing subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. Errors if one is already installed
        pub fn parse(zkem_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            // Log level comes from ZKEM_LOG
            let filter = EnvFilter::try_new(zkem_log).or_else(|_| EnvFilter::try_new("info"))?;

            match &log_frmt[..] {
                "json" => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .try_init(),
                "pretty" => tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .event_format(Format::default().pretty().with_source_location(false))
                            .fmt_fields(PrettyFields::new()),
                    )
                    .try_init(),
                _ => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer())
                    .try_init(),
            }
            .context("global tracing subscriber already installed")?;

            Ok(Self { log_frmt })
        }
    }
}
