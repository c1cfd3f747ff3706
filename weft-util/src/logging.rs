// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging for Weft workers, on the `tracing` ecosystem.

use std::sync::LazyLock;
use std::time::Instant;

use tracing_subscriber::EnvFilter;

/// Crates whose output a worker wants at the chosen level; everything else
/// stays at `warn`.
const WEFT_CRATES: &[&str] = &[
    "weft_util",
    "weft_common",
    "weft_proto",
    "weft_pubsub",
    "weft_core_worker",
];

/// Install the process-wide tracing subscriber for a Weft worker.
///
/// The filter comes from `WEFT_LOG`, then `RUST_LOG`, then a default that
/// holds the weft crates at `default_level` and dependencies at `warn`.
/// Returns false when a subscriber is already installed (e.g. by an embedding
/// runtime); the existing one is kept.
pub fn init_logging(component: &str, default_level: &str) -> bool {
    let filter = EnvFilter::try_from_env("WEFT_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| {
            let directives = WEFT_CRATES
                .iter()
                .copied()
                .fold(String::from("warn"), |directives, krate| {
                    directives + "," + krate + "=" + default_level
                });
            EnvFilter::new(directives)
        });

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(component, "logging initialized");
    }
    installed
}

/// Milliseconds since the process started. Monotonic: the suppression window
/// of [`warn_every_ms!`] must not move with wall-clock adjustments.
#[doc(hidden)]
pub fn millis_since_start() -> u64 {
    static START: LazyLock<Instant> = LazyLock::new(Instant::now);
    START.elapsed().as_millis() as u64
}

/// Emit a warning at most once per `interval_ms` per call site.
///
/// Used for warnings that arise from expected races (e.g. decrementing a ref
/// that already went out of scope) and would otherwise flood the log. The
/// first hit always logs; later hits inside the window are dropped.
#[macro_export]
macro_rules! warn_every_ms {
    ($interval_ms:expr, $($arg:tt)*) => {{
        static NEXT_ALLOWED_MS: ::std::sync::atomic::AtomicU64 =
            ::std::sync::atomic::AtomicU64::new(0);
        let now = $crate::logging::millis_since_start();
        let next = NEXT_ALLOWED_MS.load(::std::sync::atomic::Ordering::Relaxed);
        if now >= next
            && NEXT_ALLOWED_MS
                .compare_exchange(
                    next,
                    now + $interval_ms,
                    ::std::sync::atomic::Ordering::Relaxed,
                    ::std::sync::atomic::Ordering::Relaxed,
                )
                .is_ok()
        {
            ::tracing::warn!($($arg)*);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_since_start_is_monotonic() {
        let t1 = millis_since_start();
        let t2 = millis_since_start();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_warn_every_ms_does_not_panic() {
        for _ in 0..10 {
            warn_every_ms!(5000, "repeated warning {}", 42);
        }
    }
}
