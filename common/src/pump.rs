// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Bidirectional byte copy between two duplex streams.
//!
//! Half-close matters here: when one direction reaches EOF, the write side it
//! was feeding is shut down so the peer observes the EOF instead of waiting
//! forever. A client that shutdown-writes after its request would otherwise
//! deadlock against an upstream that reads to EOF before responding.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Byte counts moved in each direction by [`pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpTotals {
    /// Bytes copied from `a` to `b`.
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub b_to_a: u64,
}

/// Copies bytes in both directions until each direction has terminated.
///
/// EOF is a normal termination and not an error. If either direction fails,
/// the first error is returned, but only after the opposite direction has
/// also finished.
pub async fn pump<A, B>(a: A, b: B) -> io::Result<PumpTotals>
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut read_a, mut write_a) = tokio::io::split(a);
    let (mut read_b, mut write_b) = tokio::io::split(b);

    let forward = async {
        let copied = tokio::io::copy(&mut read_a, &mut write_b).await;
        // Propagate the EOF (or error) as a half-close.
        let _ = write_b.shutdown().await;
        copied
    };

    let backward = async {
        let copied = tokio::io::copy(&mut read_b, &mut write_a).await;
        let _ = write_a.shutdown().await;
        copied
    };

    let (forward_res, backward_res) = tokio::join!(forward, backward);

    let mut totals = PumpTotals::default();
    let mut first_err = None;

    match forward_res {
        Ok(n) => totals.a_to_b = n,
        Err(err) => first_err = Some(err),
    }
    match backward_res {
        Ok(n) => totals.b_to_a = n,
        Err(err) => {
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(totals),
    }
}
