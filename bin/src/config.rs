//! host configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "nsq-link-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/var/lib/nsq-link/config.yaml";
    /// default log level. Can use this argument or NSQ_LINK_LOG env var
    pub const DEFAULT_NSQ_LINK_LOG: &str = "info";

    use std::{net::SocketAddr, path::PathBuf};

    pub use clap::Parser;
    use clap::ValueEnum;

    /// how log lines are rendered
    #[derive(ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub enum LogFormat {
        /// unstructured
        #[default]
        Standard,
        Json,
        Pretty,
    }

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "nsq-link", bin_name = "nsq-link", about, long_about = None)]
    /// parses from cli & environment var. nsq-link will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to the nsq connection config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the address the health/metrics api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// number of worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// also consume the configured topic/channel
        #[clap(long, env)]
        pub reader: bool,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_NSQ_LINK_LOG)]
        pub nsq_link_log: String,
        /// log format
        #[clap(long, env, value_enum, default_value_t = LogFormat::Standard)]
        pub log_format: LogFormat,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let cfg = Config::try_parse_from(["nsq-link"]).unwrap();
            assert_eq!(cfg.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
            assert_eq!(cfg.external_api, "[::]:3333".parse().unwrap());
            assert_eq!(cfg.threads, None);
            assert!(!cfg.reader);
            assert_eq!(cfg.log_format, LogFormat::Standard);
        }

        #[test]
        fn test_flags() {
            let cfg = Config::try_parse_from([
                "nsq-link",
                "--config-path=/etc/nsq-link.yaml",
                "--external-api=127.0.0.1:9000",
                "--threads=2",
                "--reader",
                "--nsq-link-log=debug",
                "--log-format=json",
            ])
            .unwrap();
            assert_eq!(cfg.config_path, PathBuf::from("/etc/nsq-link.yaml"));
            assert_eq!(cfg.threads, Some(2));
            assert!(cfg.reader);
            assert_eq!(cfg.nsq_link_log, "debug");
            assert_eq!(cfg.log_format, LogFormat::Json);

            assert!(Config::try_parse_from(["nsq-link", "--log-format=xml"]).is_err());
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use super::cli::LogFormat;

    /// Configuration for `tracing`
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: LogFormat,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(nsq_link_log: &str, log_frmt: LogFormat) -> Result<Self> {
            // Log level comes from NSQ_LINK_LOG
            let filter = EnvFilter::try_new(nsq_link_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("reqwest=warn".parse()?);

            match log_frmt {
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                LogFormat::Pretty => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                LogFormat::Standard => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
