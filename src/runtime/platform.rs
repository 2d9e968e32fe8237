#[inline]
pub fn spawn<O, F>(future: F) -> tokio::task::JoinHandle<O>
where
    O: Send + 'static,
    F: std::future::Future<Output = O> + Send + 'static,
{
    tokio::spawn(future)
}

/// Runs a blocking kernel off the async workers and awaits its output.
pub async fn handle<O, F>(f: F) -> O
where
    O: Send + 'static,
    F: FnOnce() -> O + Send + 'static,
{
    let (sender, receiver) = flume::bounded(1);
    tokio::task::spawn_blocking(move || {
        _ = sender.send(f());
    });
    match receiver.recv_async().await {
        Ok(output) => output,
        Err(_) => {
            log::error!("blocking kernel exited without output");
            panic!("blocking kernel exited without output")
        }
    }
}

pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;

/// Installs a `tracing` subscriber printing evaluation spans to stderr.
#[cfg(feature = "trace")]
pub fn init_tracing() {
    use tracing_subscriber::fmt::format::FmtSpan;

    _ = tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .try_init();
}
