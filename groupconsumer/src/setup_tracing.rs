use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const DEBUG_ENV: &str = "GROUPCONSUMER_DEBUG";

/// Logs panics through `tracing` so they end up on a single line in the same format as
/// everything else, instead of as raw text on stderr.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // only captured when RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        });

    match (panic_info.location(), payload) {
        (Some(location), Some(payload)) if backtrace.status() != BacktraceStatus::Captured => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => tracing::error!("{}\n{}", panic_info, backtrace),
    }
}

fn debug_mode() -> bool {
    std::env::var(DEBUG_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Installs the global subscriber. `RUST_LOG` overrides the default level, which is `info`
/// (or `debug` with GROUPCONSUMER_DEBUG=true). Output is flattened JSON unless debugging.
pub(crate) fn register() {
    let debug_mode = debug_mode();
    // the kafka and nats clients are too chatty at debug
    let default_directives = if debug_mode {
        "debug,rdkafka=info,async_nats=info"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let layer = if debug_mode {
        fmt::layer().boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}
