// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! First things first inside the enclave: a loopback interface and a seeded
//! kernel entropy pool.
//!
//! Both steps must finish before any listener or the entrypoint starts; the
//! workload may make RNG-dependent calls immediately. On the simulation
//! backend the development host already has both, so bootstrap is a no-op.

use caisson_common::transport::{Backend, Transport};
use caisson_common::Error;

use crate::attestation::Attester;
use crate::constants::{DEV_RANDOM, ENTROPY_SEED_BYTES};

pub async fn bring_up(transport: &Transport, attester: &dyn Attester) -> Result<(), Error> {
    if transport.backend() == Backend::Simulated {
        tracing::info!("[enclave] simulation backend, skipping loopback and entropy bootstrap");
        return Ok(());
    }

    tracing::info!("[enclave] bringing up loopback");
    raise_loopback().await?;

    tracing::info!("[enclave] seeding {DEV_RANDOM} with {ENTROPY_SEED_BYTES} device bytes");
    seed_entropy(attester).await?;

    Ok(())
}

#[cfg(target_os = "linux")]
async fn raise_loopback() -> Result<(), Error> {
    let (conn, handle, _receiver) = rtnetlink::new_connection().map_err(Error::Io)?;

    // Drives the netlink socket while the request runs.
    let conn_task = tokio::spawn(conn);

    // lo is interface index 1 in a fresh enclave.
    let result = handle.link().set(1).up().execute().await;

    conn_task.abort();
    let _ = conn_task.await;

    result.map_err(|err| Error::TransportUnavailable(format!("loopback up failed: {err}")))
}

#[cfg(not(target_os = "linux"))]
async fn raise_loopback() -> Result<(), Error> {
    Ok(())
}

async fn seed_entropy(attester: &dyn Attester) -> Result<(), Error> {
    let seed = attester
        .read_entropy(ENTROPY_SEED_BYTES)
        .await
        .map_err(|err| Error::EntropyUnavailable(err.to_string()))?;

    tokio::fs::write(DEV_RANDOM, &seed)
        .await
        .map_err(|err| Error::EntropyUnavailable(format!("write to {DEV_RANDOM}: {err}")))
}
