/// Logs the panic through `tracing`, then prints it to stderr.
pub fn tracing_panic_hook(panic_info: &std::panic::PanicHookInfo) {
    let payload = panic_info.payload();
    let payload = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
    let location = panic_info.location().map(ToString::to_string);
    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    let backtrace = std::backtrace::Backtrace::capture();
    let backtrace = if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        format!("\n{backtrace}")
    } else {
        String::new()
    };
    tracing::error!(
        panic.payload = payload,
        panic.location = location,
        panic.thread = thread,
        "Thread panicked{backtrace}"
    );
    match payload {
        Some(payload) => eprintln!("Thread `{thread}` panicked: {payload}{backtrace}"),
        None => eprintln!("Thread `{thread}` panicked{backtrace}"),
    }
}
