// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Wait helpers for protocol tests.

use std::time::Duration;

/// Block the test until `condition` holds, polling with a growing backoff.
///
/// Panics on timeout, naming the protocol stage that hung — a borrower reply
/// that never arrives should fail the test with "waiting until ...", not with
/// a bare assertion three lines later.
pub async fn wait_until<F>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut backoff = Duration::from_millis(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out after {timeout:?} waiting until {what}"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_until_immediate() {
        wait_until("always true", Duration::from_secs(1), || true).await;
    }

    #[tokio::test]
    #[should_panic(expected = "waiting until never true")]
    async fn test_wait_until_times_out() {
        wait_until("never true", Duration::from_millis(30), || false).await;
    }

    #[tokio::test]
    async fn test_wait_until_eventual() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&flag);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag_clone.store(true, Ordering::SeqCst);
        });
        wait_until("the flag is set", Duration::from_secs(1), || {
            flag.load(Ordering::SeqCst)
        })
        .await;
    }
}
