//! Diagnostic logging for the module bridge.
//!
//! Every worker thread in this crate (creator, receiver, sender, supervisor,
//! host controller) runs detached from any caller that could observe a
//! `Result`, so diagnostics are reported through these functions instead of
//! propagated. When the `logwise` feature is enabled, records are routed
//! through `logwise`'s structured sync macros; otherwise they fall back to
//! `eprintln!`, matching the split the rest of this corpus uses between its
//! `logging` and `logwise` modules.

/// Logs an informational message (thread lifecycle, handshake progress).
pub fn log_info(str: &str) {
    #[cfg(feature = "logwise")]
    {
        logwise::info_sync!("{msg}", msg = str);
    }
    #[cfg(not(feature = "logwise"))]
    {
        eprintln!("[modbridge] info: {}", str);
    }
}

/// Logs a recoverable problem: dropped message, contended lock, best-effort
/// send failure.
pub fn log_warn(str: &str) {
    #[cfg(feature = "logwise")]
    {
        logwise::warn_sync!("{msg}", msg = str);
    }
    #[cfg(not(feature = "logwise"))]
    {
        eprintln!("[modbridge] warn: {}", str);
    }
}

/// Logs a failure that ends a thread's loop or a creation attempt.
pub fn log_error(str: &str) {
    #[cfg(feature = "logwise")]
    {
        logwise::error_sync!("{msg}", msg = str);
    }
    #[cfg(not(feature = "logwise"))]
    {
        eprintln!("[modbridge] error: {}", str);
    }
}
