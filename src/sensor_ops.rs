//! Sensor interactions shared by several routes: status round-trips, the
//! ensure-idle preamble, chunked bulk transfers and the enroll event filter.
//!
//! All of these run on top of a held [`SensorLease`], so replies arrive on
//! the operation's private channel in arrival order. The protocol has no
//! correlation tag; commands are strictly serial, so the next reply is the
//! reply.
use std::time::Duration;

use async_stream::try_stream;
use bytes::Bytes;
use futures_util::Stream;
use tracing::{debug, info, warn};

use crate::coordinator::{AppState, SensorLease};
use crate::error::GatewayError;
use crate::fpc_codec::{Response, SensorEvent, StateFlag, MAX_CHUNK_SIZE};

/// Idle ceiling for streamed bulk transfers and enroll touch pacing.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Publish a frame and await the next reply on the lease.
pub async fn transact(
    state: &AppState,
    lease: &mut SensorLease,
    frame: Vec<u8>,
) -> Result<Response, GatewayError> {
    state.sink.publish_frame(frame).await?;
    lease.recv().await
}

/// STATUS round-trip. With `filtered`, the always-on flags
/// (STATE_APP_FW_READY, STATE_SECURE_INTERFACE) are removed so the caller
/// sees only activity that needs aborting.
pub async fn get_status(
    state: &AppState,
    lease: &mut SensorLease,
    filtered: bool,
) -> Result<Response, GatewayError> {
    let frame = state.encode(|codec| codec.status())?;
    match transact(state, lease, frame).await? {
        Response::Status {
            event,
            states,
            app_fail_code,
        } => {
            let states = if filtered {
                states
                    .into_iter()
                    .filter(|flag| {
                        !matches!(flag, StateFlag::AppFwReady | StateFlag::SecureInterface)
                    })
                    .collect()
            } else {
                states
            };
            Ok(Response::Status {
                event,
                states,
                app_fail_code,
            })
        }
        _ => Err(GatewayError::UnexpectedReply {
            context: "querying status",
        }),
    }
}

/// Make the sensor quiescent before an operation that needs it: if any
/// activity flag remains after filtering, issue ABORT and await its reply.
pub async fn ensure_idle(state: &AppState, lease: &mut SensorLease) -> Result<(), GatewayError> {
    let status = get_status(state, lease, true).await?;
    if let Response::Status { states, .. } = &status {
        if !states.is_empty() {
            info!(?states, "sensor not idle, sending abort");
            let frame = state.encode(|codec| codec.abort())?;
            transact(state, lease, frame).await?;
        }
    }
    Ok(())
}

/// Stream `total` bytes off the sensor in MAX_CHUNK_SIZE slices. The lease
/// moves into the stream and is released when the generator is dropped or
/// exhausted, so the finite channel stays open for exactly as long as the
/// response body is being produced.
pub fn download_stream(
    state: AppState,
    mut lease: SensorLease,
    total: u32,
) -> impl Stream<Item = Result<Bytes, GatewayError>> {
    try_stream! {
        let mut remaining = total;
        while remaining > 0 {
            let chunk = MAX_CHUNK_SIZE.min(remaining);
            let frame = state.encode(|codec| codec.data_get(chunk))?;
            state.sink.publish_frame(frame).await?;
            match lease.recv_within(STREAM_IDLE_TIMEOUT).await? {
                Response::DataGet {
                    remaining: left,
                    chunk_size,
                    data,
                } => {
                    if chunk_size != chunk || left != remaining - chunk {
                        Err(GatewayError::ChunkMismatch {
                            requested: chunk,
                            got: chunk_size,
                            remaining: left,
                        })?;
                    }
                    debug!(chunk, left, "chunk received");
                    remaining = left;
                    yield Bytes::from(data);
                }
                _ => {
                    Err(GatewayError::UnexpectedReply {
                        context: "downloading data",
                    })?;
                }
            }
        }
    }
}

/// Push a template blob up in MAX_CHUNK_SIZE slices, verifying the sensor's
/// running byte count after every DATA_PUT.
pub async fn push_template(
    state: &AppState,
    lease: &mut SensorLease,
    data: &[u8],
) -> Result<(), GatewayError> {
    let total = data.len();
    let mut remaining = total;
    while remaining > 0 {
        let chunk_len = (MAX_CHUNK_SIZE as usize).min(remaining);
        let start = total - remaining;
        let chunk = &data[start..start + chunk_len];
        let frame = state.encode(|codec| codec.data_put(remaining as u32, chunk))?;
        match transact(state, lease, frame).await? {
            Response::DataPut { total_received } => {
                let expected = (start + chunk_len) as u32;
                if total_received != expected {
                    return Err(GatewayError::ChunkMismatch {
                        requested: chunk_len as u32,
                        got: total_received,
                        remaining: remaining as u32,
                    });
                }
                debug!(total_received, "chunk accepted");
                remaining = total - total_received as usize;
            }
            _ => {
                return Err(GatewayError::UnexpectedReply {
                    context: "uploading data",
                });
            }
        }
    }
    Ok(())
}

/// True for the low-information events the enroll flow swallows while
/// waiting for a terminal result.
pub fn is_enroll_noise(response: &Response) -> bool {
    match response {
        Response::Enroll { feedback, .. } => feedback.is_progress(),
        Response::Status { event, .. } => matches!(
            event,
            SensorEvent::FingerDetect | SensorEvent::ImageReady | SensorEvent::FingerLost
        ),
        _ => false,
    }
}

/// Consume enroll events until the first one that is neither progress
/// feedback nor a low-information finger event; that event is the terminal
/// result. One trailing EVENT_FINGER_LOST is drained before the lease is
/// handed back.
pub async fn await_enroll_result(lease: &mut SensorLease) -> Result<Response, GatewayError> {
    loop {
        let event = lease.recv_within(STREAM_IDLE_TIMEOUT).await?;
        if is_enroll_noise(&event) {
            debug!(?event, "enroll progress skipped");
            continue;
        }
        if let Err(error) = lease.recv_within(STREAM_IDLE_TIMEOUT).await {
            warn!(%error, "trailing finger-lost event never arrived");
        }
        return Ok(event);
    }
}
