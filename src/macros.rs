//! Internal macros

/// Run `$body`, recording how long it took in `$histogram` with
/// `$labels`.
#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Lock a [`std::sync::Mutex`], carrying on with the inner value if a
/// previous holder panicked.
///
/// A panicking processor thread must not take the whole engine with
/// it; the data behind these locks stays structurally valid between
/// statements.
#[macro_export]
macro_rules! lock {
    ($mutex: expr) => {
        $mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    };
}

#[macro_export]
macro_rules! read_lock {
    ($rwlock: expr) => {
        $rwlock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    };
}

#[macro_export]
macro_rules! write_lock {
    ($rwlock: expr) => {
        $rwlock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    };
}
