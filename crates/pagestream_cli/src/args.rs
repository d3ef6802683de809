use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use pagestream_core::{
    ConcurrencyStrategy, CrawlParams, EngineOptions, ExecutionMode, StreamParams, TuningParams,
    UploadParams,
};
use pagestream_engine::settings::TransportSettings;

/// Drive the pagestream crawl engine and publish what it produces.
#[derive(Parser, Debug)]
#[command(name = "pagestream", version, about)]
pub struct Cli {
    /// More log output; repeat for debug and trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write the log to this file.
    #[arg(long, global = true, env = "PAGESTREAM_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Settings file replacing `config/pagestream`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Engine binary, bypassing the bundled and PATH lookup.
    #[arg(long, global = true, env = "PAGESTREAM_ENGINE")]
    pub engine: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crawl URLs and report where each artifact was written.
    Crawl(CrawlArgs),
    /// Crawl URLs and publish the artifacts to a broker topic.
    Stream(StreamArgs),
    /// Crawl URLs and let the engine upload the artifacts to object storage.
    Upload(UploadArgs),
    /// Print the CLI and engine versions.
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    /// URLs to crawl.
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Directory the engine writes artifacts into.
    #[arg(short, long)]
    pub outdir: Option<PathBuf>,

    /// Hand every URL to one engine process running them in parallel.
    #[arg(long, conflicts_with = "workers")]
    pub parallel: bool,

    /// Run one engine process per URL, this many at a time.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Per-process timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Ask the engine to re-validate URLs before fetching.
    #[arg(long)]
    pub validate: bool,

    /// Maximum pages per engine process.
    #[arg(long)]
    pub limit: Option<u32>,

    /// Remote browser endpoint (ws:// or wss://).
    #[arg(long)]
    pub proxy: Option<String>,

    /// Engine-side fetch timeout in seconds.
    #[arg(long)]
    pub fetch_timeout: Option<u64>,

    /// Write pagestream-manifest.json into the output directory.
    #[arg(long, requires = "outdir")]
    pub manifest: bool,
}

impl CrawlArgs {
    pub fn mode(&self) -> ExecutionMode {
        match (self.workers, self.parallel) {
            (Some(workers), _) => ExecutionMode::Concurrent(ConcurrencyStrategy::FanOut { workers }),
            (None, true) => ExecutionMode::Concurrent(ConcurrencyStrategy::Delegated),
            (None, false) => ExecutionMode::Sequential,
        }
    }

    pub fn params(&self) -> CrawlParams {
        CrawlParams {
            urls: self.urls.clone(),
            output_dir: self.outdir.clone(),
            mode: self.mode(),
            timeout: self.timeout.map(Duration::from_secs),
            engine: EngineOptions {
                validate: self.validate,
                limit: self.limit,
                proxy: self.proxy.clone(),
                fetch_timeout: self.fetch_timeout.map(Duration::from_secs),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    #[command(flatten)]
    pub crawl: CrawlArgs,

    /// Broker addresses (host:port), comma separated or repeated.
    #[arg(long, value_delimiter = ',')]
    pub brokers: Vec<String>,

    /// Destination topic.
    #[arg(long)]
    pub topic: Option<String>,

    /// Content kinds to publish: markup, text or both.
    #[arg(long, default_value = "both")]
    pub content: String,

    /// Session id shared by every message; generated when omitted.
    #[arg(long)]
    pub session: Option<String>,

    #[arg(long)]
    pub max_message_size: Option<usize>,

    #[arg(long)]
    pub buffer_memory: Option<usize>,

    #[arg(long)]
    pub max_request_size: Option<usize>,

    /// none, gzip, snappy, lz4 or zstd.
    #[arg(long)]
    pub compression: Option<String>,

    /// Let the engine publish by itself instead of this process.
    #[arg(long)]
    pub via_engine: bool,
}

impl StreamArgs {
    /// Command-line values win; settings fill whatever was left out.
    pub fn params(&self, transport: &TransportSettings) -> StreamParams {
        let defaults = transport.tuning();
        let brokers = if self.brokers.is_empty() {
            transport.brokers.clone()
        } else {
            self.brokers.clone()
        };
        StreamParams {
            crawl: self.crawl.params(),
            brokers,
            topic: self.topic.clone().unwrap_or_else(|| transport.topic.clone()),
            content: self.content.clone(),
            session: self.session.clone(),
            tuning: TuningParams {
                max_message_size: self.max_message_size.or(defaults.max_message_size),
                buffer_memory: self.buffer_memory.or(defaults.buffer_memory),
                max_request_size: self.max_request_size.or(defaults.max_request_size),
                compression: self.compression.clone().or(defaults.compression),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    #[command(flatten)]
    pub crawl: CrawlArgs,

    /// Object key prefix shared by the batch; generated when omitted.
    #[arg(long)]
    pub uuid: Option<String>,
}

impl UploadArgs {
    pub fn params(&self) -> UploadParams {
        UploadParams {
            crawl: self.crawl.params(),
            uuid: self.uuid.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).expect("valid command line")
    }

    #[test]
    fn crawl_flags_map_to_execution_mode() {
        let Command::Crawl(args) = parse(&["pagestream", "crawl", "--parallel", "https://a.example"]).command
        else {
            panic!("expected crawl");
        };
        assert_eq!(
            args.mode(),
            ExecutionMode::Concurrent(ConcurrencyStrategy::Delegated)
        );

        let Command::Crawl(args) =
            parse(&["pagestream", "crawl", "--workers", "3", "https://a.example"]).command
        else {
            panic!("expected crawl");
        };
        assert_eq!(
            args.mode(),
            ExecutionMode::Concurrent(ConcurrencyStrategy::FanOut { workers: 3 })
        );

        assert!(Cli::try_parse_from(["pagestream", "crawl", "--parallel", "--workers", "2", "https://a"]).is_err());
        assert!(Cli::try_parse_from(["pagestream", "crawl"]).is_err());
    }

    #[test]
    fn stream_arguments_override_settings() {
        let transport = TransportSettings {
            brokers: vec!["settings:9092".into()],
            topic: "from_settings".into(),
            username: None,
            password: None,
            client_id: None,
            use_tls: false,
            max_retry: 3,
            compression: "gzip".into(),
            max_message_size: Some(2048),
            buffer_memory: None,
            max_request_size: None,
        };

        let Command::Stream(args) = parse(&[
            "pagestream",
            "stream",
            "--brokers",
            "a:9092,b:9092",
            "--compression",
            "zstd",
            "https://a.example",
        ])
        .command
        else {
            panic!("expected stream");
        };
        let params = args.params(&transport);
        assert_eq!(params.brokers, vec!["a:9092".to_string(), "b:9092".to_string()]);
        assert_eq!(params.topic, "from_settings");
        assert_eq!(params.content, "both");
        assert_eq!(params.tuning.max_message_size, Some(2048));
        assert_eq!(params.tuning.compression.as_deref(), Some("zstd"));
        assert_eq!(params.crawl.urls, vec!["https://a.example".to_string()]);
    }

    #[test]
    fn upload_takes_crawl_flags_and_a_uuid() {
        let Command::Upload(args) = parse(&[
            "pagestream",
            "upload",
            "--uuid",
            "run-42",
            "--outdir",
            "/tmp/out",
            "https://a.example",
        ])
        .command
        else {
            panic!("expected upload");
        };
        let params = args.params();
        assert_eq!(params.uuid.as_deref(), Some("run-42"));
        assert_eq!(params.crawl.output_dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(params.crawl.urls, vec!["https://a.example".to_string()]);

        let Command::Upload(args) = parse(&["pagestream", "upload", "https://a.example"]).command
        else {
            panic!("expected upload");
        };
        assert_eq!(args.params().uuid, None);
    }
}
