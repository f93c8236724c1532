//! `keyline request`: send authenticated requests through the session client.
//!
//! With `--concurrency N` the same request is fired N times at once, which is
//! a quick way to watch a single refresh serve a whole wave of 401s.

use crate::OutputFormat;
use anyhow::{Context, Result};
use clap::Args;
use futures::future::join_all;
use keyline_core::auth::Session;
use keyline_core::{ApiRequest, ApiResponse, ApiResult};
use parse::{parse_header, parse_method};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct RequestArgs {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE, ...)
    pub method: String,

    /// Path relative to the API URL, or an absolute URL
    pub path: String,

    /// JSON request body
    #[arg(short, long)]
    pub data: Option<String>,

    /// Extra header, as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Send the request this many times concurrently
    #[arg(short, long, default_value = "1")]
    pub concurrency: usize,

    /// Exit with an error when the response status is not 2xx
    #[arg(long)]
    pub fail: bool,
}

fn build_request(args: &RequestArgs) -> Result<ApiRequest> {
    let method = parse_method(&args.method)?;
    let mut request = ApiRequest::new(method, args.path.as_str());

    if let Some(data) = &args.data {
        let body: serde_json::Value =
            serde_json::from_str(data).context("--data must be valid JSON")?;
        request = request.json(&body)?;
    }

    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        request = request.header(name, value);
    }

    Ok(request)
}

pub async fn run(session: &Session, args: &RequestArgs, format: OutputFormat) -> Result<()> {
    let request = build_request(args)?;
    let concurrency = args.concurrency.max(1);

    if !session.is_signed_in() {
        tracing::warn!("No stored access token, sending without one");
    }

    // Ctrl+C cancels in-flight requests without tearing down the session
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, cancelling requests");
                cancel.cancel();
            }
        })
    };

    let client = session.client();
    let results: Vec<ApiResult<ApiResponse>> = join_all(
        (0..concurrency).map(|_| client.send_with_cancel(request.clone(), &cancel)),
    )
    .await;
    watcher.abort();

    // A refresh may have rotated the session cookie
    session.persist_cookies();

    let mut failed = false;
    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(resp) => {
                failed |= args.fail && !resp.is_success();
                print_response(i, concurrency, &resp, format);
            }
            Err(e) => {
                failed = true;
                match format {
                    OutputFormat::Text => eprintln!("Request failed: {}", e),
                    OutputFormat::Json => {
                        println!("{}", serde_json::json!({
                            "index": i,
                            "error": e.to_string(),
                            "unauthorized": e.is_unauthorized(),
                        }));
                    }
                }
            }
        }
    }

    if failed {
        return Err(anyhow::anyhow!("{} {} did not succeed", args.method.to_uppercase(), args.path));
    }
    Ok(())
}

fn print_response(index: usize, total: usize, resp: &ApiResponse, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            if total > 1 {
                println!("[{}] {}", index + 1, resp.status());
            } else {
                println!("{}", resp.status());
            }
            let body = resp
                .json::<serde_json::Value>()
                .ok()
                .and_then(|v| serde_json::to_string_pretty(&v).ok())
                .unwrap_or_else(|| resp.text());
            if !body.is_empty() {
                println!("{}", body);
            }
        }
        OutputFormat::Json => {
            let body = resp
                .json::<serde_json::Value>()
                .unwrap_or_else(|_| serde_json::Value::String(resp.text()));
            println!("{}", serde_json::json!({
                "index": index,
                "status": resp.status().as_u16(),
                "body": body,
            }));
        }
    }
}

/// Parsing helpers for method and header arguments.
mod parse {
    use anyhow::{Context, Result};
    use keyline_core::client::{HeaderName, HeaderValue, Method};

    pub fn parse_method(raw: &str) -> Result<Method> {
        Method::from_bytes(raw.to_uppercase().as_bytes())
            .with_context(|| format!("Invalid HTTP method: {}", raw))
    }

    pub fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue)> {
        let (name, value) = raw
            .split_once(':')
            .with_context(|| format!("Header must look like \"Name: value\", got {:?}", raw))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("Invalid header name: {}", name.trim()))?;
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("Invalid header value for {}", name))?;
        Ok((name, value))
    }

}
