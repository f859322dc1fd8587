use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use feedpipe_core::{HeaderMap, Params, PipelineConfig, PipelineRequest};
use feedpipe_pipeline::{PipelineOutcome, TransformPipeline};
use feedpipe_pool::PoolStats;
use feedpipe_stream::{ProducerResponse, Response};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub struct RunArgs {
    pub config: PathBuf,
    pub input: PathBuf,
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<String>,
    pub params: Vec<String>,
    pub uri: String,
    pub method: String,
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub route: String,
    pub status: u16,
    pub bytes_written: u64,
    pub producer: String,
    pub pool: PoolStats,
}

impl Summary {
    fn new(outcome: &PipelineOutcome, pool: PoolStats) -> Self {
        Self {
            route: outcome.route.to_string(),
            status: outcome.status,
            bytes_written: outcome.bytes_written,
            producer: outcome.producer.to_string(),
            pool,
        }
    }
}

pub async fn run(args: &RunArgs, format: &str) -> anyhow::Result<()> {
    let mut sink = Response::new(tokio::io::stdout());
    let summary = execute(args, &mut sink).await?;

    match format {
        "json" => eprintln!("{}", serde_json::to_string_pretty(&summary)?),
        _ => {
            eprintln!("route:    {}", summary.route);
            eprintln!("status:   {}", summary.status);
            eprintln!("bytes:    {}", summary.bytes_written);
            eprintln!("producer: {}", summary.producer);
            eprintln!(
                "pool:     {} created, {} idle, {} discarded",
                summary.pool.created, summary.pool.idle, summary.pool.discarded
            );
        }
    }
    Ok(())
}

/// Run `args.input` through the configured pipeline into `sink`.
pub async fn execute<W>(args: &RunArgs, sink: &mut Response<W>) -> anyhow::Result<Summary>
where
    W: AsyncWrite + Unpin + Send,
{
    let config = PipelineConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let mut pipeline =
        TransformPipeline::from_config(&config).context("failed to build pipeline")?;

    let overrides = parse_params(&args.params)?;
    if !overrides.is_empty() {
        pipeline =
            pipeline.with_param_source(Arc::new(move |_: &PipelineRequest| overrides.clone()));
    }

    let request = Arc::new(PipelineRequest::new(
        args.method.as_str(),
        args.uri.as_str(),
        parse_headers(&args.headers)?,
    ));

    let input = args.input.clone();
    let status = args.status;
    let content_type = args.content_type.clone();
    let producer = move |_: Arc<PipelineRequest>, mut resp: ProducerResponse| async move {
        resp.set_status(status);
        if let Some(ct) = &content_type {
            resp.set_content_type(ct);
        }
        let mut file = tokio::fs::File::open(&input)
            .await
            .with_context(|| format!("failed to open {}", input.display()))?;
        let mut out = resp.output_stream()?;
        tokio::io::copy(&mut file, &mut out).await?;
        out.flush().await?;
        anyhow::Ok(())
    };

    let result = pipeline.run(request, producer, sink).await;
    pipeline.pool().log_stats();
    let outcome = result.context("pipeline run failed")?;
    Ok(Summary::new(&outcome, pipeline.pool().stats()))
}

pub(crate) fn parse_headers(raw: &[String]) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once(':') else {
            bail!("invalid header {entry:?}, expected NAME:VALUE");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("invalid header {entry:?}, empty name");
        }
        headers.append(name, value.trim());
    }
    Ok(headers)
}

pub(crate) fn parse_params(raw: &[String]) -> anyhow::Result<Params> {
    let mut params = Params::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            bail!("invalid parameter {entry:?}, expected NAME=VALUE");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("invalid parameter {entry:?}, empty name");
        }
        params.insert(name, value);
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedpipe_core::ParamValue;
    use std::io::Write;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_headers() {
        let headers = parse_headers(&strings(&[
            "X-Tenant-Id: 5821027",
            "Accept:application/atom+xml",
        ]))
        .unwrap();
        assert_eq!(headers.get("x-tenant-id"), Some("5821027"));
        assert_eq!(headers.get("accept"), Some("application/atom+xml"));
        assert!(parse_headers(&strings(&["no-colon"])).is_err());
        assert!(parse_headers(&strings(&[":value"])).is_err());
    }

    #[test]
    fn parses_params_keeping_equals_in_value() {
        let params = parse_params(&strings(&["correct_url=https://a.example.com/?x=1"])).unwrap();
        assert_eq!(
            params.get("correct_url"),
            Some(&ParamValue::from("https://a.example.com/?x=1"))
        );
        assert!(parse_params(&strings(&["missing"])).is_err());
    }

    const CONFIG: &str = r#"
[pool]
min_idle = 1
max_size = 1

[params]
correct_url = "https://feeds.example.com"

[definition]
name = "external-href"
kind = "rewrite"

[[definition.rules]]
pattern = 'href="https?://[^/"]+/'
replacement = 'href="{{correct_url}}/'
"#;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn args(config: &tempfile::NamedTempFile, input: &tempfile::NamedTempFile) -> RunArgs {
        RunArgs {
            config: config.path().to_path_buf(),
            input: input.path().to_path_buf(),
            status: 200,
            content_type: Some("application/atom+xml".into()),
            headers: Vec::new(),
            params: Vec::new(),
            uri: "/feeds/tenant".into(),
            method: "GET".into(),
        }
    }

    #[tokio::test]
    async fn execute_transforms_input_file() {
        let config = write_temp(CONFIG);
        let input = write_temp(
            r#"<feed><link href="http://internal:8080/feeds/tenant"/></feed>"#,
        );

        let mut sink = Response::new(Vec::<u8>::new());
        let summary = execute(&args(&config, &input), &mut sink).await.unwrap();

        assert_eq!(summary.route, "transformed");
        assert_eq!(summary.status, 200);
        assert_eq!(
            String::from_utf8(sink.get_ref().clone()).unwrap(),
            r#"<feed><link href="https://feeds.example.com/feeds/tenant"/></feed>"#
        );
    }

    #[tokio::test]
    async fn param_flags_override_config() {
        let config = write_temp(CONFIG);
        let input = write_temp(r#"<a href="https://internal/x"/>"#);
        let mut run_args = args(&config, &input);
        run_args.params = strings(&["correct_url=https://other.example.com"]);

        let mut sink = Response::new(Vec::<u8>::new());
        execute(&run_args, &mut sink).await.unwrap();
        assert_eq!(
            String::from_utf8(sink.get_ref().clone()).unwrap(),
            r#"<a href="https://other.example.com/x"/>"#
        );
    }

    #[tokio::test]
    async fn error_status_is_passed_through() {
        let config = write_temp(CONFIG);
        let input = write_temp("<error>backend down</error>");
        let mut run_args = args(&config, &input);
        run_args.status = 503;

        let mut sink = Response::new(Vec::<u8>::new());
        let summary = execute(&run_args, &mut sink).await.unwrap();
        assert_eq!(summary.route, "passthrough (status 503)");
        assert_eq!(summary.status, 503);
        assert_eq!(sink.get_ref().as_slice(), b"<error>backend down</error>");

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["pool"]["created"], 1);
    }

    #[tokio::test]
    async fn missing_input_fails_the_run() {
        let config = write_temp(CONFIG);
        let input = write_temp("");
        let mut run_args = args(&config, &input);
        run_args.input = PathBuf::from("/nonexistent/feedpipe-input.xml");

        let mut sink = Response::new(Vec::<u8>::new());
        let err = execute(&run_args, &mut sink).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to open"));
        assert_eq!(sink.status(), 500);
    }
}
