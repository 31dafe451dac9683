//! Native bindings behind the prelude's `native` table.
//!
//! ```text
//! provider script:  providerContext.axios.get(url)
//!      ↓            prelude.js (axios/fetch facade)
//! native.request:   Async binding, returns a Promise<string>
//!      ↓            spawned on the host runtime, raced against abort
//!      ↓            CapabilityContext::http_request
//! reqwest:          GET url with browser headers
//! ```
//!
//! Fallible bindings answer with a JSON envelope, `{"ok": value}` or
//! `{"err": message}`, which the prelude unwraps into a value or a thrown
//! `Error`. Nothing here raises a QuickJS exception directly.

use std::future::Future;
use std::sync::Arc;

use rquickjs::prelude::Async;
use rquickjs::{Ctx, Function, Object};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capability::{self, crypto, extract, html, CapabilityContext};

/// Everything one sandbox instance may reach.
pub(crate) struct Bridge {
    pub caps: Arc<CapabilityContext>,
    /// Runtime of the caller; network work runs there, not on the sandbox thread.
    pub host: Handle,
    pub abort: CancellationToken,
    pub label: Arc<str>,
}

pub(crate) fn envelope<T: Serialize>(result: capability::Result<T>) -> String {
    let value = match result.map(serde_json::to_value) {
        Ok(Ok(value)) => serde_json::json!({ "ok": value }),
        Ok(Err(e)) => serde_json::json!({ "err": e.to_string() }),
        Err(e) => serde_json::json!({ "err": e.to_string() }),
    };
    value.to_string()
}

fn aborted() -> String {
    serde_json::json!({ "err": "aborted", "aborted": true }).to_string()
}

/// Re-emit a sandbox `console.*` call as a tracing event.
fn console_event(provider: &str, level: &str, message: &str) {
    match level {
        "error" => error!(target: "vega_relay::sandbox::console", provider, "{message}"),
        "warn" => warn!(target: "vega_relay::sandbox::console", provider, "{message}"),
        "debug" => debug!(target: "vega_relay::sandbox::console", provider, "{message}"),
        "trace" => trace!(target: "vega_relay::sandbox::console", provider, "{message}"),
        _ => info!(target: "vega_relay::sandbox::console", provider, "{message}"),
    }
}

/// Run `work` on the host runtime until it finishes or `abort` fires.
async fn on_host<F>(host: &Handle, abort: &CancellationToken, work: F) -> String
where
    F: Future<Output = String> + Send + 'static,
{
    let mut task = host.spawn(work);
    tokio::select! {
        biased;
        () = abort.cancelled() => {
            task.abort();
            aborted()
        }
        joined = &mut task => joined.unwrap_or_else(|e| {
            envelope::<()>(Err(capability::CapabilityError::Http(e.to_string())))
        }),
    }
}

async fn http_request(
    caps: Arc<CapabilityContext>,
    host: Handle,
    abort: CancellationToken,
    method: String,
    url: String,
    headers: String,
    body: Option<String>,
) -> String {
    let headers: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(&headers) {
        Ok(headers) => headers,
        Err(e) => {
            return envelope::<()>(Err(capability::CapabilityError::InvalidRequest(format!(
                "headers: {e}"
            ))))
        }
    };

    on_host(&host, &abort, async move {
        envelope(caps.http_request(&method, &url, &headers, body).await)
    })
    .await
}

async fn base_url(
    caps: Arc<CapabilityContext>,
    host: Handle,
    abort: CancellationToken,
    provider: String,
) -> String {
    on_host(&host, &abort, async move { envelope(caps.base_url(&provider).await) }).await
}

/// Build the `native` object handed to the prelude.
pub(crate) fn native_table<'js>(ctx: &Ctx<'js>, bridge: Bridge) -> rquickjs::Result<Object<'js>> {
    let native = Object::new(ctx.clone())?;
    let Bridge {
        caps,
        host,
        abort,
        label,
    } = bridge;

    native.set(
        "log",
        Function::new(ctx.clone(), move |level: String, message: String| {
            console_event(&label, &level, &message);
        })?,
    )?;

    let request_caps = Arc::clone(&caps);
    let request_host = host.clone();
    let request_abort = abort.clone();
    native.set(
        "request",
        Function::new(
            ctx.clone(),
            Async(
                move |method: String, url: String, headers: String, body: Option<String>| {
                    http_request(
                        Arc::clone(&request_caps),
                        request_host.clone(),
                        request_abort.clone(),
                        method,
                        url,
                        headers,
                        body,
                    )
                },
            ),
        )?,
    )?;

    let base_caps = Arc::clone(&caps);
    let base_host = host;
    let base_abort = abort.clone();
    native.set(
        "baseUrl",
        Function::new(
            ctx.clone(),
            Async(move |provider: String| {
                base_url(Arc::clone(&base_caps), base_host.clone(), base_abort.clone(), provider)
            }),
        )?,
    )?;

    let abort_flag = abort;
    native.set(
        "isAborted",
        Function::new(ctx.clone(), move || abort_flag.is_cancelled())?,
    )?;

    native.set(
        "commonHeaders",
        serde_json::to_string(caps.common_headers()).unwrap_or_else(|_| "{}".to_string()),
    )?;

    native.set(
        "select",
        Function::new(ctx.clone(), |markup: String, selector: String| {
            envelope(html::select(&markup, &selector))
        })?,
    )?;
    native.set(
        "digest",
        Function::new(ctx.clone(), |algorithm: String, data: String| {
            envelope(crypto::digest_hex(&algorithm, &data))
        })?,
    )?;
    native.set(
        "base64Encode",
        Function::new(ctx.clone(), |data: String| crypto::base64_encode(&data))?,
    )?;
    native.set(
        "base64Decode",
        Function::new(ctx.clone(), |data: String| envelope(crypto::base64_decode(&data)))?,
    )?;
    native.set(
        "hexEncode",
        Function::new(ctx.clone(), |data: String| crypto::hex_encode(&data))?,
    )?;
    native.set(
        "aesCbcDecrypt",
        Function::new(ctx.clone(), |data: String, key: String, iv: String| {
            envelope(crypto::aes_cbc_decrypt(&data, &key, &iv))
        })?,
    )?;
    native.set(
        "isPacked",
        Function::new(ctx.clone(), |source: String| extract::is_packed(&source))?,
    )?;
    native.set(
        "unpack",
        Function::new(ctx.clone(), |source: String| envelope(extract::unpack(&source)))?,
    )?;
    native.set(
        "findMediaUrls",
        Function::new(ctx.clone(), |text: String| {
            serde_json::to_string(&extract::find_media_urls(&text)).unwrap_or_else(|_| "[]".to_string())
        })?,
    )?;

    Ok(native)
}
