use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use engine_logging::{engine_info, engine_warn};
use pagestream_core::validate_stream;
use pagestream_engine::{
    write_manifest, BatchSummary, DispatchSettings, EngineLocator, Orchestrator, ProcessDispatcher,
    ProcessExecutor, Settings,
};

use crate::args::{Cli, Command, CrawlArgs, StreamArgs, UploadArgs};

pub async fn execute(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref(), None).context("loading settings")?;

    let mut locator = EngineLocator::from_settings(&settings.engine);
    if let Some(path) = &cli.engine {
        locator = locator.with_explicit(path.clone());
    }
    let executor = ProcessExecutor::locate(&locator).context("locating the crawl engine")?;
    engine_info!("using engine at {}", executor.binary().path().display());

    match cli.command {
        Command::Version => {
            let engine_version = executor.version().await.context("querying engine version")?;
            println!("pagestream {}", env!("CARGO_PKG_VERSION"));
            println!("engine {engine_version}");
            Ok(())
        }
        Command::Crawl(args) => {
            let orchestrator = orchestrator(executor, &settings);
            crawl(&orchestrator, &args).await
        }
        Command::Stream(args) => {
            let orchestrator = orchestrator(executor, &settings);
            stream(&orchestrator, &settings, &args).await
        }
        Command::Upload(args) => {
            let orchestrator = orchestrator(executor, &settings);
            upload(&orchestrator, &args).await
        }
    }
}

fn orchestrator(executor: ProcessExecutor, settings: &Settings) -> Orchestrator {
    let dispatcher = ProcessDispatcher::new(
        Arc::new(executor),
        DispatchSettings::from(&settings.engine),
    );
    Orchestrator::new(dispatcher)
}

async fn crawl(orchestrator: &Orchestrator, args: &CrawlArgs) -> Result<()> {
    let result = orchestrator.crawl(args.params()).await?;
    finish(&result, args)
}

async fn upload(orchestrator: &Orchestrator, args: &UploadArgs) -> Result<()> {
    let result = orchestrator.upload(args.params()).await?;
    finish(&result, &args.crawl)
}

async fn stream(orchestrator: &Orchestrator, settings: &Settings, args: &StreamArgs) -> Result<()> {
    let params = args.params(&settings.transport);
    let result = if args.via_engine {
        orchestrator.stream_via_engine(params).await?
    } else {
        let request = validate_stream(params)?;
        let publisher = publisher(settings, &request).await?;
        orchestrator.stream_request(&request, &publisher).await?
    };
    finish(&result, &args.crawl)
}

#[cfg(feature = "kafka")]
async fn publisher(
    settings: &Settings,
    request: &pagestream_core::StreamRequest,
) -> Result<pagestream_engine::StreamPublisher> {
    use pagestream_engine::{KafkaProducer, StreamPublisher, TransportConfig};

    let config = TransportConfig::new(&settings.transport, request);
    let producer = KafkaProducer::connect(&config)
        .await
        .context("connecting to the broker")?;
    Ok(StreamPublisher::new(config, Arc::new(producer)))
}

#[cfg(not(feature = "kafka"))]
async fn publisher(
    _settings: &Settings,
    _request: &pagestream_core::StreamRequest,
) -> Result<pagestream_engine::StreamPublisher> {
    bail!("built without the `kafka` feature; rebuild with it or pass --via-engine")
}

fn finish<T: BatchSummary>(result: &T, args: &CrawlArgs) -> Result<()> {
    if args.manifest {
        if let Some(dir) = &args.outdir {
            write_batch_manifest(dir, result);
        }
    }
    println!("{}", serde_json::to_string_pretty(result)?);

    if result.url_count() > 0 && result.succeeded() == 0 {
        bail!("no url succeeded");
    }
    Ok(())
}

fn write_batch_manifest<T: BatchSummary>(dir: &Path, result: &T) {
    let generated = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    match write_manifest(dir, result, &generated) {
        Ok(path) => engine_info!("manifest written to {}", path.display()),
        Err(err) => engine_warn!("could not write manifest: {}", err),
    }
}
