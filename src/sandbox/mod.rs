//! Sandboxed execution of provider modules (`QuickJS` via rquickjs).
//!
//! Every [`SandboxExecutor::execute`] call builds a fresh runtime and
//! context, evaluates the host prelude, then runs the provider source inside
//! a CommonJS-style wrapper. The module can see exactly:
//!
//! - `exports` and `module` (with its own `module.exports` object)
//! - `require`, which returns `{}` for any name
//! - `console`, re-emitted as tracing events
//! - `Promise` and the `__awaiter` generator driver
//! - `providerContext`, backed by [`CapabilityContext`]
//!
//! The context has no module loader and no host globals beyond the
//! ECMAScript built-ins: no `fetch`, timers, `process` or filesystem.
//!
//! QuickJS values are tied to the thread that owns their runtime, so each
//! execution gets a dedicated thread running a current-thread tokio
//! runtime. [`ExportSurface`] is a channel handle to that thread; only
//! JSON and strings cross it. Capability futures (HTTP, base URLs) are
//! spawned back onto the caller's runtime.

mod bridge;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::{
    async_with, AsyncContext, AsyncRuntime, CatchResultExt, CaughtError, Ctx, Function, Object,
    Persistent, Value,
};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, Instrument};

use crate::capability::CapabilityContext;
use crate::config::SandboxConfig;
use bridge::Bridge;

const PRELUDE: &str = include_str!("prelude.js");
const COMMAND_QUEUE: usize = 8;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// The module failed to compile or threw while loading.
    #[error("module execution failed: {0}")]
    Execution(String),

    /// An invoked export threw or rejected; carries the script's message.
    #[error("{0}")]
    Script(String),

    #[error("export '{0}' is not a function")]
    NotAFunction(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("script exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("JavaScript engine error: {0}")]
    Engine(String),

    #[error("value conversion failed: {0}")]
    Conversion(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[allow(clippy::needless_pass_by_value)]
fn engine(e: rquickjs::Error) -> SandboxError {
    SandboxError::Engine(e.to_string())
}

/// Wall-clock deadline checked by the `QuickJS` interrupt handler.
#[derive(Clone, Default)]
struct Deadline(Arc<Mutex<Option<Instant>>>);

impl Deadline {
    fn arm(&self, budget: Duration) {
        if let Ok(mut at) = self.0.lock() {
            *at = Some(Instant::now() + budget);
        }
    }

    fn disarm(&self) {
        if let Ok(mut at) = self.0.lock() {
            *at = None;
        }
    }

    fn expired(&self) -> bool {
        self.0
            .lock()
            .ok()
            .and_then(|at| *at)
            .is_some_and(|at| Instant::now() >= at)
    }

    fn handler(&self) -> Box<dyn FnMut() -> bool + 'static> {
        let deadline = self.clone();
        Box::new(move || deadline.expired())
    }
}

/// Compiles and runs provider sources, one isolated runtime per call.
pub struct SandboxExecutor {
    capabilities: Arc<CapabilityContext>,
    config: SandboxConfig,
    executions: AtomicU64,
}

impl SandboxExecutor {
    pub fn new(capabilities: Arc<CapabilityContext>, config: SandboxConfig) -> Self {
        Self {
            capabilities,
            config,
            executions: AtomicU64::new(0),
        }
    }

    /// Number of `execute` calls so far.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Run `source` and return what it exported.
    ///
    /// The result is `module.exports` when it has own keys, else `exports`.
    /// A syntax error or a throw during load is [`SandboxError::Execution`].
    #[instrument(skip_all, fields(label = %label, bytes = source.len()))]
    pub async fn execute(&self, source: &str, label: &str) -> Result<ExportSurface> {
        self.executions.fetch_add(1, Ordering::Relaxed);

        let host = Handle::try_current().map_err(|e| SandboxError::Engine(e.to_string()))?;
        let abort = CancellationToken::new();
        let label: Arc<str> = Arc::from(label);
        let bridge = Bridge {
            caps: Arc::clone(&self.capabilities),
            host,
            abort: abort.clone(),
            label: Arc::clone(&label),
        };

        let (ready, loaded) = oneshot::channel();
        let (commands, inbox) = mpsc::channel(COMMAND_QUEUE);
        let job = Job {
            wrapped: wrap_module(source),
            bridge,
            config: self.config.clone(),
            inbox,
            ready,
            span: tracing::Span::current(),
        };
        std::thread::Builder::new()
            .name(format!("sandbox-{label}"))
            .spawn(move || job.run())
            .map_err(|e| SandboxError::Engine(format!("failed to start sandbox thread: {e}")))?;

        loaded.await.map_err(|_| thread_gone())??;
        debug!("Module loaded");

        Ok(ExportSurface {
            commands,
            abort,
            label,
        })
    }
}

fn thread_gone() -> SandboxError {
    SandboxError::Engine("sandbox thread exited".to_string())
}

/// Everything the sandbox thread needs to load a module and serve it.
struct Job {
    wrapped: String,
    bridge: Bridge,
    config: SandboxConfig,
    inbox: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<()>>,
    span: tracing::Span,
}

impl Job {
    fn run(self) {
        let Job {
            wrapped,
            bridge,
            config,
            mut inbox,
            ready,
            span,
        } = self;

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready.send(Err(SandboxError::Engine(e.to_string())));
                return;
            }
        };

        runtime.block_on(
            async move {
                let instance = match Instance::load(&wrapped, bridge, &config).await {
                    Ok(instance) => instance,
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                };
                if ready.send(Ok(())).is_err() {
                    return;
                }
                while let Some(command) = inbox.recv().await {
                    instance.serve(command).await;
                }
                debug!("Sandbox released");
            }
            .instrument(span),
        );
    }
}

/// Requests from an [`ExportSurface`] to its sandbox thread.
enum Command {
    Keys {
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    GetJson {
        path: String,
        reply: oneshot::Sender<Result<Option<serde_json::Value>>>,
    },
    IsFunction {
        path: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Invoke {
        path: String,
        args: String,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<serde_json::Value>>,
    },
}

/// A loaded module, owned by its sandbox thread.
struct Instance {
    // Field order is drop order: JS handles go before their runtime.
    exports: Persistent<Object<'static>>,
    host: Persistent<Object<'static>>,
    context: AsyncContext,
    _runtime: AsyncRuntime,
    abort: CancellationToken,
    deadline: Deadline,
    invoke_timeout: Duration,
}

impl Instance {
    async fn load(wrapped: &str, bridge: Bridge, config: &SandboxConfig) -> Result<Self> {
        let runtime = AsyncRuntime::new().map_err(engine)?;
        runtime.set_memory_limit(config.memory_limit_mb * 1024 * 1024).await;
        runtime.set_max_stack_size(config.max_stack_kb * 1024).await;
        let deadline = Deadline::default();
        runtime.set_interrupt_handler(Some(deadline.handler())).await;
        let context = AsyncContext::full(&runtime).await.map_err(engine)?;

        let abort = bridge.abort.clone();
        let budget = Duration::from_secs(config.cpu_timeout_secs);
        let wrapped = wrapped.to_string();

        deadline.arm(budget);
        let loaded = async_with!(context => |ctx| {
            match load(&ctx, bridge, &wrapped).catch(&ctx) {
                Ok((exports, host)) => Ok((Persistent::save(&ctx, exports), Persistent::save(&ctx, host))),
                Err(caught) => Err(caught_message(&ctx, caught)),
            }
        })
        .await;
        let interrupted = deadline.expired();
        deadline.disarm();

        let (exports, host) = loaded.map_err(|message| {
            if interrupted {
                SandboxError::Timeout(budget)
            } else {
                SandboxError::Execution(message)
            }
        })?;

        Ok(Self {
            exports,
            host,
            context,
            _runtime: runtime,
            abort,
            deadline,
            invoke_timeout: Duration::from_secs(config.invoke_timeout_secs),
        })
    }

    async fn serve(&self, command: Command) {
        // A dropped reply means the caller stopped waiting.
        match command {
            Command::Keys { reply } => {
                let _ = reply.send(self.keys().await);
            }
            Command::GetJson { path, reply } => {
                let _ = reply.send(self.get_json(path).await);
            }
            Command::IsFunction { path, reply } => {
                let _ = reply.send(self.is_function(path).await);
            }
            Command::Invoke {
                path,
                args,
                cancel,
                reply,
            } => {
                let _ = reply.send(self.invoke(path, args, cancel).await);
            }
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let exports = self.exports.clone();
        async_with!(self.context => |ctx| {
            let root = exports.restore(&ctx).map_err(engine)?;
            root.keys::<String>()
                .collect::<rquickjs::Result<Vec<_>>>()
                .map_err(engine)
        })
        .await
    }

    async fn get_json(&self, path: String) -> Result<Option<serde_json::Value>> {
        let exports = self.exports.clone();
        async_with!(self.context => |ctx| {
            let root = exports.restore(&ctx).map_err(engine)?;
            let value = lookup(&root, &path).map_err(engine)?;
            if value.is_undefined() {
                return Ok(None);
            }
            to_json(&ctx, value).map(Some)
        })
        .await
    }

    async fn is_function(&self, path: String) -> Result<bool> {
        let exports = self.exports.clone();
        async_with!(self.context => |ctx| {
            let root = exports.restore(&ctx).map_err(engine)?;
            Ok(lookup(&root, &path).map_err(engine)?.is_function())
        })
        .await
    }

    async fn invoke(&self, path: String, args: String, cancel: CancellationToken) -> Result<serde_json::Value> {
        let budget = self.invoke_timeout;
        self.deadline.arm(budget);
        let outcome = tokio::time::timeout(budget, self.call_export(path, args, cancel)).await;
        let interrupted = self.deadline.expired();
        self.deadline.disarm();

        match outcome {
            Err(_) => {
                self.abort.cancel();
                Err(SandboxError::Timeout(budget))
            }
            Ok(Err(SandboxError::Script(_))) if interrupted => Err(SandboxError::Timeout(budget)),
            Ok(result) => result,
        }
    }

    async fn call_export(&self, path: String, args: String, cancel: CancellationToken) -> Result<serde_json::Value> {
        let exports = self.exports.clone();
        let host = self.host.clone();
        let abort = self.abort.clone();

        async_with!(self.context => |ctx| {
            let root = exports.restore(&ctx).map_err(engine)?;
            let host = host.restore(&ctx).map_err(engine)?;

            let target = lookup(&root, &path).map_err(engine)?;
            let Some(function) = target.as_function().cloned() else {
                return Err(SandboxError::NotAFunction(path));
            };

            let args: Value = ctx.json_parse(args).map_err(engine)?;
            let with_host: Function = host.get("callArgs").map_err(engine)?;
            let args: Value = with_host.call((args,)).map_err(engine)?;

            let returned: Value = function
                .call((args,))
                .catch(&ctx)
                .map_err(|caught| SandboxError::Script(caught_message(&ctx, caught)))?;

            let settled = match returned.as_promise().cloned() {
                Some(promise) => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            abort.cancel();
                            let fire: Function = host.get("abort").map_err(engine)?;
                            fire.call::<_, ()>(()).map_err(engine)?;
                            return Err(SandboxError::Cancelled);
                        }
                        settled = promise.into_future::<Value>() => settled
                            .catch(&ctx)
                            .map_err(|caught| SandboxError::Script(caught_message(&ctx, caught)))?,
                    }
                }
                None => returned,
            };

            to_json(&ctx, settled)
        })
        .await
    }
}

/// CommonJS wrapper. The trailing expression picks the export object.
fn wrap_module(source: &str) -> String {
    format!(
        "(function (exports, module, require, console, Promise, __awaiter, providerContext) {{\n{source}\n;return module.exports && Object.keys(module.exports).length ? module.exports : exports;\n}})"
    )
}

fn load<'js>(
    ctx: &Ctx<'js>,
    bridge: Bridge,
    wrapped: &str,
) -> rquickjs::Result<(Object<'js>, Object<'js>)> {
    let native = bridge::native_table(ctx, bridge)?;
    let prelude: Function = ctx.eval(PRELUDE)?;
    let host: Object = prelude.call((native,))?;

    let wrapper: Function = ctx.eval(wrapped)?;
    let loader: Function = host.get("load")?;
    let exports: Object = loader.call((wrapper,))?;
    Ok((exports, host))
}

/// Message of a caught exception or thrown value.
fn caught_message<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>) -> String {
    match caught {
        CaughtError::Exception(exception) => exception
            .message()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| exception.to_string()),
        CaughtError::Value(value) => {
            if let Some(s) = value.as_string().and_then(|s| s.to_string().ok()) {
                return s;
            }
            ctx.json_stringify(value)
                .ok()
                .flatten()
                .and_then(|s| s.to_string().ok())
                .unwrap_or_else(|| "non-error value thrown".to_string())
        }
        CaughtError::Error(e) => e.to_string(),
    }
}

/// Walk a dotted path (`default.getStream`). A missing segment or a
/// non-object in the middle yields `undefined`.
fn lookup<'js>(root: &Object<'js>, path: &str) -> rquickjs::Result<Value<'js>> {
    let mut current = root.clone().into_value();
    for segment in path.split('.') {
        let Some(object) = current.as_object() else {
            return Ok(Value::new_undefined(root.ctx().clone()));
        };
        current = object.get(segment)?;
    }
    Ok(current)
}

fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value> {
    if value.is_undefined() || value.is_null() {
        return Ok(serde_json::Value::Null);
    }
    let Some(text) = ctx.json_stringify(value).map_err(engine)? else {
        return Ok(serde_json::Value::Null);
    };
    let text = text.to_string().map_err(engine)?;
    serde_json::from_str(&text).map_err(|e| SandboxError::Conversion(e.to_string()))
}

/// The exported value of one execution.
///
/// A handle to the sandbox thread that owns the module. Not cached: modules
/// may have load-time side effects, so every caller gets its own surface.
/// Dropping it aborts any capability call still in flight and lets the
/// thread free the runtime.
pub struct ExportSurface {
    commands: mpsc::Sender<Command>,
    abort: CancellationToken,
    label: Arc<str>,
}

impl ExportSurface {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| thread_gone())?;
        response.await.map_err(|_| thread_gone())?
    }

    /// Own enumerable keys of the export object.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.request(|reply| Command::Keys { reply }).await
    }

    /// JSON value at `path`, `None` when undefined.
    pub async fn get_json(&self, path: &str) -> Result<Option<serde_json::Value>> {
        let path = path.to_string();
        self.request(|reply| Command::GetJson { path, reply }).await
    }

    /// Whether the export at `path` is callable.
    pub async fn is_function(&self, path: &str) -> Result<bool> {
        let path = path.to_string();
        self.request(|reply| Command::IsFunction { path, reply }).await
    }

    /// Call the export at `path` with `args` and settle its result.
    ///
    /// Object arguments gain `signal` and `providerContext`. A returned
    /// promise is awaited. Cancelling `cancel`, or dropping the returned
    /// future, aborts in-flight capability calls and fires the script's
    /// abort listeners; the former fails with [`SandboxError::Cancelled`].
    pub async fn invoke(
        &self,
        path: &str,
        args: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let args = serde_json::to_string(args).map_err(|e| SandboxError::Conversion(e.to_string()))?;
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        debug!(provider = %self.label, export = %path, "Invoking export");

        let invocation = cancel.child_token();
        let _guard = invocation.clone().drop_guard();
        let path = path.to_string();
        self.request(|reply| Command::Invoke {
            path,
            args,
            cancel: invocation,
            reply,
        })
        .await
    }
}

impl Drop for ExportSurface {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}
