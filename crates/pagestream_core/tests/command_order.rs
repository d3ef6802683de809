use std::path::PathBuf;
use std::time::Duration;

use pagestream_core::{
    validate_crawl, validate_stream, validate_upload, Action, BuildError, CommandBuilder,
    ConcurrencyStrategy, CrawlParams, EngineOptions, ExecutionMode, Flag, Invocation, StreamParams,
    UploadParams,
};
use pretty_assertions::assert_eq;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn crawl_params(urls: &[&str]) -> CrawlParams {
    CrawlParams {
        urls: args(urls),
        output_dir: Some(PathBuf::from("/tmp/test_output")),
        ..CrawlParams::default()
    }
}

/// Index of the action token; every earlier argument is a flag or flag value.
fn action_index(rendered: &[String]) -> usize {
    rendered
        .iter()
        .position(|arg| arg == "-crawl" || arg == "-kafka" || arg == "-r2")
        .expect("action token present")
}

#[test]
fn outdir_precedes_crawl_which_precedes_url() {
    let request = validate_crawl(crawl_params(&["https://example.com"])).unwrap();
    let invocation =
        CommandBuilder::for_crawl(&request, &request.urls, false).expect("invocation");

    assert_eq!(
        invocation.args(),
        args(&["-outdir", "/tmp/test_output", "-crawl", "https://example.com"])
    );
}

#[test]
fn every_flag_lands_before_the_action_and_every_url_after() {
    let params = CrawlParams {
        urls: args(&["https://a.example.com", "https://b.example.com/x?y=1"]),
        output_dir: Some(PathBuf::from("out")),
        mode: ExecutionMode::Concurrent(ConcurrencyStrategy::Delegated),
        timeout: Some(Duration::from_secs(30)),
        engine: EngineOptions {
            validate: true,
            limit: Some(100),
            proxy: Some("ws://127.0.0.1:9222".into()),
            fetch_timeout: Some(Duration::from_secs(20)),
        },
    };
    let request = validate_crawl(params).unwrap();
    let invocation = CommandBuilder::for_crawl(&request, &request.urls, true).unwrap();
    let rendered = invocation.args();
    let action = action_index(&rendered);

    assert_eq!(rendered[action], "-crawl");
    assert_eq!(&rendered[action + 1..], &request.urls[..]);
    for flag in ["-outdir", "-parallel", "-validate", "-limit", "-timeout", "-proxy"] {
        let pos = rendered.iter().position(|arg| arg == flag).unwrap();
        assert!(pos < action, "{flag} after action in {rendered:?}");
    }
    Invocation::check_order(&rendered).expect("grammar holds");
}

#[test]
fn stream_flags_precede_kafka_action() {
    let params = StreamParams {
        crawl: crawl_params(&["https://example.com", "https://example.org"]),
        brokers: args(&["localhost:9092", "kafka:9093"]),
        topic: "crawl_data".into(),
        content: "both".into(),
        session: Some("batch-7".into()),
        ..StreamParams::default()
    };
    let request = validate_stream(params).unwrap();
    let invocation = CommandBuilder::for_stream(&request, &request.crawl.urls, false).unwrap();
    let rendered = invocation.args();

    assert_eq!(
        rendered,
        args(&[
            "-outdir",
            "/tmp/test_output",
            "-content",
            "both",
            "-session",
            "batch-7",
            "-topic",
            "crawl_data",
            "-brokers",
            "localhost:9092,kafka:9093",
            "-kafka",
            "https://example.com",
            "https://example.org",
        ])
    );
}

#[test]
fn upload_uuid_precedes_r2_action() {
    let request = validate_upload(UploadParams {
        crawl: crawl_params(&["https://example.com"]),
        uuid: Some("run-42".into()),
    })
    .unwrap();
    let invocation = CommandBuilder::for_upload(&request, &request.crawl.urls, false).unwrap();
    let rendered = invocation.args();

    assert_eq!(
        rendered,
        args(&[
            "-outdir",
            "/tmp/test_output",
            "-uuid",
            "run-42",
            "-r2",
            "https://example.com",
        ])
    );
    Invocation::check_order(&rendered).expect("grammar holds");
    assert!(Invocation::check_order(&args(&["-r2", "https://example.com", "-uuid", "x"])).is_err());
}

#[test]
fn upload_without_uuid_gets_a_generated_one() {
    let request = validate_upload(UploadParams {
        crawl: crawl_params(&["https://example.com"]),
        uuid: None,
    })
    .unwrap();
    assert_eq!(request.uuid.as_str().len(), 36);

    let err = validate_upload(UploadParams {
        crawl: crawl_params(&["https://example.com"]),
        uuid: Some("has space".into()),
    })
    .unwrap_err();
    assert!(matches!(err, pagestream_core::ValidationError::InvalidSession(_)));
}

#[test]
fn builder_rejects_url_that_would_be_read_as_flag() {
    let err = CommandBuilder::new()
        .url("https://example.com")
        .url("-outdir")
        .build(Action::Crawl)
        .unwrap_err();
    assert_eq!(err, BuildError::UrlLooksLikeFlag("-outdir".into()));
}

#[test]
fn builder_rejects_flag_value_that_looks_like_a_flag() {
    let err = CommandBuilder::new()
        .flag(Flag::OutputDir(PathBuf::from("-crawl")))
        .url("https://example.com")
        .build(Action::Crawl)
        .unwrap_err();
    assert!(matches!(err, BuildError::InvalidFlagValue { flag: "-outdir", .. }));
}

#[test]
fn builder_rejects_missing_urls_and_duplicate_flags() {
    assert_eq!(
        CommandBuilder::new().build(Action::Crawl).unwrap_err(),
        BuildError::NoUrls
    );
    let err = CommandBuilder::new()
        .flag(Flag::Parallel)
        .flag(Flag::Parallel)
        .url("https://example.com")
        .build(Action::Crawl)
        .unwrap_err();
    assert_eq!(err, BuildError::DuplicateFlag("-parallel"));
}

#[test]
fn check_order_flags_the_known_bad_orderings() {
    // Action before URL before flag.
    assert_eq!(
        Invocation::check_order(&args(&[
            "-crawl",
            "https://example.com",
            "-outdir",
            "/tmp/x"
        ])),
        Err(BuildError::FlagAfterAction("-outdir".into()))
    );
    // Action before flags before URL.
    assert_eq!(
        Invocation::check_order(&args(&["-crawl", "-outdir", "/tmp/x", "https://example.com"])),
        Err(BuildError::FlagAfterAction("-outdir".into()))
    );
    // URL before action.
    assert_eq!(
        Invocation::check_order(&args(&["https://example.com", "-crawl"])),
        Err(BuildError::UrlBeforeAction("https://example.com".into()))
    );
    assert_eq!(
        Invocation::check_order(&args(&["-outdir", "/tmp/x"])),
        Err(BuildError::MissingAction)
    );
    assert_eq!(
        Invocation::check_order(&args(&["-crawl"])),
        Err(BuildError::NoUrls)
    );
    assert!(matches!(
        Invocation::check_order(&args(&["-outdir", "-crawl", "https://example.com"])),
        Err(BuildError::InvalidFlagValue { flag: "-outdir", .. })
    ));
}

#[test]
fn rendered_invocations_always_satisfy_the_grammar() {
    let url_sets: &[&[&str]] = &[
        &["https://example.com"],
        &["https://a.example.com", "http://b.example.com/path"],
        &["https://1.example", "https://2.example", "https://3.example", "https://4.example"],
    ];
    for urls in url_sets {
        for parallel in [false, true] {
            let request = validate_crawl(crawl_params(urls)).unwrap();
            let invocation = CommandBuilder::for_crawl(&request, &request.urls, parallel).unwrap();
            let rendered = invocation.args();
            Invocation::check_order(&rendered).unwrap();
            assert_eq!(invocation.has_flag("-parallel"), parallel);
            assert_eq!(rendered.len() - action_index(&rendered) - 1, urls.len());
        }
    }
}
